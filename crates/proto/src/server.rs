// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The protocol server: accepts connections, registers clients with the
//! graph actor, and runs one task per connection that demarshals requests
//! inbound and marshals events outbound.

use crate::connection::Connection;
use crate::messages::{self, Class};
use patchbay_core::format::FormatTypes;
use patchbay_core::{Error, ObjectId, Properties, Result};
use patchbay_graph::{ClientEvent, EventPayload, GraphHandle, Request};
use std::collections::HashMap;
use tokio::net::UnixListener;
use tokio::sync::mpsc;

/// Accept loop. Runs until the listener fails or the actor goes away.
pub async fn serve(listener: UnixListener, handle: GraphHandle) -> Result<()> {
    let (_, format_types) = handle.describe().await?;
    loop {
        let (stream, _addr) = listener.accept().await?;
        let conn = Connection::new(stream);
        let handle = handle.clone();
        let format_types = format_types.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_client(conn, handle, format_types).await {
                tracing::debug!(error = %err, "client connection ended");
            }
        });
    }
}

/// Tracks which demarshal table each client-local resource id uses.
///
/// Ids 0 and 1 are fixed (core, registry); bound resources learn their class
/// from the info event the bind produces, the way event tables are installed
/// on resource creation.
struct ClassMap {
    classes: HashMap<u32, Class>,
}

impl ClassMap {
    fn new() -> Self {
        let mut classes = HashMap::new();
        classes.insert(ObjectId::CORE.0, Class::Core);
        Self { classes }
    }

    fn get(&self, id: u32) -> Option<Class> {
        self.classes.get(&id).copied()
    }

    fn learn_from_request(&mut self, request: &Request) {
        match request {
            Request::GetRegistry { new_id } => {
                self.classes.insert(new_id.0, Class::Registry);
            },
            Request::CreateClientNode { new_id, .. } => {
                self.classes.insert(new_id.0, Class::ClientNode);
            },
            _ => {},
        }
    }

    fn learn_from_event(&mut self, resource: ObjectId, payload: &EventPayload) {
        if let EventPayload::RemoveId { id } = payload {
            self.classes.remove(&id.0);
            return;
        }
        if let Some(class) = messages::class_for_event(payload) {
            // A client-node resource already has its table; the node info it
            // receives must not downgrade it.
            self.classes.entry(resource.0).or_insert(class);
        }
    }
}

/// One connection's lifetime: register the client, shuttle messages until
/// either side goes away, deregister.
async fn serve_client(
    mut conn: Connection,
    handle: GraphHandle,
    format_types: FormatTypes,
) -> Result<()> {
    let creds = match conn.peer_creds() {
        Ok(creds) => Some(creds),
        Err(err) => {
            tracing::warn!(error = %err, "no peer credentials");
            None
        },
    };
    let (event_tx, mut events) = mpsc::unbounded_channel::<ClientEvent>();
    let client = handle.new_client(creds, Properties::new(), event_tx).await?;
    tracing::debug!(client = %client, "serving connection");

    let mut classes = ClassMap::new();
    let result = connection_loop(&mut conn, &handle, client, &mut classes, &mut events, &format_types)
        .await;
    handle.client_gone(client);
    result
}

async fn connection_loop(
    conn: &mut Connection,
    handle: &GraphHandle,
    client: ObjectId,
    classes: &mut ClassMap,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    format_types: &FormatTypes,
) -> Result<()> {
    enum Step {
        Incoming,
        Outgoing(Option<ClientEvent>),
    }

    loop {
        let step = tokio::select! {
            ready = conn.readable() => {
                ready?;
                Step::Incoming
            },
            event = events.recv() => Step::Outgoing(event),
        };
        match step {
            Step::Incoming => {
                if !conn.fill()? {
                    return Ok(());
                }
                while let Some(message) = conn.next_message()? {
                    let Some(class) = classes.get(message.id) else {
                        // Unknown resource ids are fatal to the connection.
                        tracing::error!(
                            client = %client, resource = message.id,
                            "unknown resource id"
                        );
                        return Err(Error::Protocol(format!(
                            "unknown resource id {}",
                            message.id
                        )));
                    };
                    match messages::demarshal_request(
                        class,
                        message.opcode,
                        &message.payload,
                        format_types,
                    ) {
                        Ok(request) => {
                            classes.learn_from_request(&request);
                            handle.request(client, ObjectId(message.id), request)?;
                        },
                        Err(err) => {
                            // Unknown opcodes drop the message.
                            tracing::warn!(
                                client = %client, resource = message.id,
                                opcode = message.opcode, error = %err,
                                "dropping request"
                            );
                        },
                    }
                }
            },
            Step::Outgoing(None) => {
                // The server side dropped the client.
                return Ok(());
            },
            Step::Outgoing(Some(event)) => {
                classes.learn_from_event(event.resource, &event.payload);
                let resource = event.resource;
                let (opcode, payload, fds) =
                    messages::marshal_event(event.payload, format_types)?;
                conn.send(resource.0, opcode, &payload, &fds).await?;
            },
        }
    }
}
