// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Media format descriptions and the candidate-intersection rule used by
//! link negotiation.

use crate::error::{Error, Result};
use crate::pod::Pod;
use crate::type_map::{TypeId, TypeMap};
use serde::{Deserialize, Serialize};

/// Sample encoding of raw audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16,
    S24,
    S32,
    F32,
    F64,
}

impl SampleFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::U8 => "U8",
            Self::S16 => "S16",
            Self::S24 => "S24",
            Self::S32 => "S32",
            Self::F32 => "F32",
            Self::F64 => "F64",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "U8" => Self::U8,
            "S16" => Self::S16,
            "S24" => Self::S24,
            "S32" => Self::S32,
            "F32" => Self::F32,
            "F64" => Self::F64,
            _ => return None,
        })
    }

    /// Bytes per sample, one channel.
    pub const fn stride(self) -> u32 {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S24 => 3,
            Self::S32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Raw interleaved audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioRaw {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u32,
}

/// Raw video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRaw {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Frames per second as a fraction.
    pub framerate: (u32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb,
    Rgba,
    I420,
    Nv12,
}

impl PixelFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rgb => "RGB",
            Self::Rgba => "RGBA",
            Self::I420 => "I420",
            Self::Nv12 => "NV12",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "RGB" => Self::Rgb,
            "RGBA" => Self::Rgba,
            "I420" => Self::I420,
            "NV12" => Self::Nv12,
            _ => return None,
        })
    }
}

/// A fully specified media format, as settled on a port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "media", rename_all = "snake_case")]
pub enum MediaFormat {
    AudioRaw(AudioRaw),
    VideoRaw(VideoRaw),
    /// Pre-encoded payload identified by its MIME-ish type string.
    Encoded { media_type: String },
}

impl MediaFormat {
    pub fn media_class(&self) -> &str {
        match self {
            Self::AudioRaw(_) => "audio/raw",
            Self::VideoRaw(_) => "video/raw",
            Self::Encoded { media_type } => media_type,
        }
    }

    /// Suggested minimum buffer size for one processing quantum.
    pub fn default_buffer_size(&self) -> u32 {
        match self {
            Self::AudioRaw(audio) => {
                // One 1024-frame period.
                1024 * audio.channels * audio.format.stride()
            },
            Self::VideoRaw(video) => video.width * video.height * 4,
            Self::Encoded { .. } => 4096,
        }
    }

    pub fn default_stride(&self) -> u32 {
        match self {
            Self::AudioRaw(audio) => audio.channels * audio.format.stride(),
            Self::VideoRaw(video) => video.width * 4,
            Self::Encoded { .. } => 0,
        }
    }
}

/// Well-known type-map entries for format objects.
#[derive(Debug, Clone)]
pub struct FormatTypes {
    pub format: TypeId,
    pub key_media_class: TypeId,
    pub key_audio_format: TypeId,
    pub key_rate: TypeId,
    pub key_channels: TypeId,
    pub key_video_format: TypeId,
    pub key_width: TypeId,
    pub key_height: TypeId,
    pub key_framerate: TypeId,
    pub key_media_type: TypeId,
}

impl FormatTypes {
    pub fn register(map: &TypeMap) -> Self {
        Self {
            format: map.id_of("patchbay:object:Format"),
            key_media_class: map.id_of("patchbay:format:mediaClass"),
            key_audio_format: map.id_of("patchbay:format:audio:format"),
            key_rate: map.id_of("patchbay:format:audio:rate"),
            key_channels: map.id_of("patchbay:format:audio:channels"),
            key_video_format: map.id_of("patchbay:format:video:format"),
            key_width: map.id_of("patchbay:format:video:width"),
            key_height: map.id_of("patchbay:format:video:height"),
            key_framerate: map.id_of("patchbay:format:video:framerate"),
            key_media_type: map.id_of("patchbay:format:encoded:mediaType"),
        }
    }
}

impl MediaFormat {
    /// Wire form: a typed object pod.
    pub fn to_pod(&self, types: &FormatTypes) -> Pod {
        let mut props = vec![(
            types.key_media_class.0,
            Pod::String(self.media_class().to_string()),
        )];
        match self {
            Self::AudioRaw(audio) => {
                props.push((
                    types.key_audio_format.0,
                    Pod::String(audio.format.as_str().to_string()),
                ));
                props.push((types.key_rate.0, Pod::Int(audio.rate as i32)));
                props.push((types.key_channels.0, Pod::Int(audio.channels as i32)));
            },
            Self::VideoRaw(video) => {
                props.push((
                    types.key_video_format.0,
                    Pod::String(video.format.as_str().to_string()),
                ));
                props.push((types.key_width.0, Pod::Int(video.width as i32)));
                props.push((types.key_height.0, Pod::Int(video.height as i32)));
                props.push((
                    types.key_framerate.0,
                    Pod::Fraction { num: video.framerate.0, denom: video.framerate.1 },
                ));
            },
            Self::Encoded { media_type } => {
                props.push((types.key_media_type.0, Pod::String(media_type.clone())));
            },
        }
        Pod::Object { type_id: types.format.0, props }
    }

    pub fn from_pod(pod: &Pod, types: &FormatTypes) -> Result<Self> {
        let class = pod
            .prop(types.key_media_class.0)
            .and_then(Pod::as_str)
            .ok_or_else(|| Error::Protocol("format object lacks a media class".into()))?;
        match class {
            "audio/raw" => {
                let format = pod
                    .prop(types.key_audio_format.0)
                    .and_then(Pod::as_str)
                    .and_then(SampleFormat::parse)
                    .ok_or_else(|| Error::Protocol("bad audio sample format".into()))?;
                let rate = get_int(pod, types.key_rate)?;
                let channels = get_int(pod, types.key_channels)?;
                Ok(Self::AudioRaw(AudioRaw { format, rate, channels }))
            },
            "video/raw" => {
                let format = pod
                    .prop(types.key_video_format.0)
                    .and_then(Pod::as_str)
                    .and_then(PixelFormat::parse)
                    .ok_or_else(|| Error::Protocol("bad pixel format".into()))?;
                let width = get_int(pod, types.key_width)?;
                let height = get_int(pod, types.key_height)?;
                let framerate = match pod.prop(types.key_framerate.0) {
                    Some(Pod::Fraction { num, denom }) => (*num, *denom),
                    _ => return Err(Error::Protocol("bad framerate".into())),
                };
                Ok(Self::VideoRaw(VideoRaw { format, width, height, framerate }))
            },
            other => Ok(Self::Encoded { media_type: other.to_string() }),
        }
    }
}

fn get_int(pod: &Pod, key: TypeId) -> Result<u32> {
    pod.prop(key.0)
        .and_then(Pod::as_int)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| Error::Protocol("missing integer format field".into()))
}

/// Picks the format both sides can carry: the first output candidate that
/// the input side also offers and that every filter admits.
pub fn intersect<'a>(
    outputs: &'a [MediaFormat],
    inputs: &[MediaFormat],
    filters: &[MediaFormat],
) -> Option<&'a MediaFormat> {
    outputs.iter().find(|candidate| {
        inputs.contains(candidate)
            && (filters.is_empty() || filters.contains(candidate))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_48k() -> MediaFormat {
        MediaFormat::AudioRaw(AudioRaw { format: SampleFormat::S16, rate: 48000, channels: 2 })
    }

    fn f32_48k() -> MediaFormat {
        MediaFormat::AudioRaw(AudioRaw { format: SampleFormat::F32, rate: 48000, channels: 2 })
    }

    #[test]
    fn intersect_returns_first_survivor() {
        let outputs = [f32_48k(), s16_48k()];
        let inputs = [s16_48k()];
        assert_eq!(intersect(&outputs, &inputs, &[]), Some(&s16_48k()));
    }

    #[test]
    fn intersect_respects_filters() {
        let outputs = [f32_48k(), s16_48k()];
        let inputs = [f32_48k(), s16_48k()];
        assert_eq!(intersect(&outputs, &inputs, &[s16_48k()]), Some(&s16_48k()));
        assert_eq!(intersect(&outputs, &inputs, &[]), Some(&f32_48k()));
    }

    #[test]
    fn disjoint_candidates_find_nothing() {
        assert_eq!(intersect(&[f32_48k()], &[s16_48k()], &[]), None);
    }

    #[test]
    fn pod_roundtrip() {
        let map = TypeMap::new();
        let types = FormatTypes::register(&map);
        for format in [
            s16_48k(),
            MediaFormat::VideoRaw(VideoRaw {
                format: PixelFormat::I420,
                width: 1280,
                height: 720,
                framerate: (30, 1),
            }),
            MediaFormat::Encoded { media_type: "audio/opus".into() },
        ] {
            let back = MediaFormat::from_pod(&format.to_pod(&types), &types).unwrap();
            assert_eq!(back, format);
        }
    }

    #[test]
    fn buffer_sizing_follows_the_format() {
        let audio = s16_48k();
        assert_eq!(audio.default_buffer_size(), 1024 * 2 * 2);
        assert_eq!(audio.default_stride(), 4);
    }
}
