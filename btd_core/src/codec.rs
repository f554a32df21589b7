//! A2DP/SCO codec identity and configuration-blob decoding.
//!
//! Mirrors the bitmask-decode shape used by Bluetooth stacks for A2DP
//! codec capability blobs (sampling frequency / channel mode packed as
//! bitfields per codec), but restricted to what the transport core
//! needs: turning an opaque configuration byte blob into the
//! `(format, channels, sampling)` triple a PCM endpoint is configured
//! with.

use bitflags::bitflags;

use crate::error::{Error, ErrorKind, Result};

/// Sample storage format negotiated for a PCM endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SampleFormat {
    S16_2Le,
    S24_4Le,
    S32_4Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16_2Le => 2,
            SampleFormat::S24_4Le => 4,
            SampleFormat::S32_4Le => 4,
        }
    }
}

/// The codecs this core knows how to decode a configuration blob for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum A2dpCodecId {
    Sbc,
    Mpeg24Aac,
    AptX,
    AptXHd,
    Ldac,
    FastStream,
}

bitflags! {
    /// Sampling-frequency bitmask, as packed into an SBC-style
    /// configuration byte. Other codecs reuse the same bit positions
    /// for the frequencies they support.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct SamplingFreq: u8 {
        const FREQ_16000 = 0x01;
        const FREQ_32000 = 0x02;
        const FREQ_44100 = 0x04;
        const FREQ_48000 = 0x08;
        const FREQ_88200 = 0x10;
        const FREQ_96000 = 0x20;
    }
}

bitflags! {
    /// Channel-mode bitmask, as packed into the first configuration byte.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ChannelMode: u8 {
        const MONO = 0x01;
        const DUAL_CHANNEL = 0x02;
        const STEREO = 0x04;
        const JOINT_STEREO = 0x08;
    }
}

fn highest_freq_hz(mask: SamplingFreq) -> Option<u32> {
    if mask.contains(SamplingFreq::FREQ_96000) {
        Some(96_000)
    } else if mask.contains(SamplingFreq::FREQ_88200) {
        Some(88_200)
    } else if mask.contains(SamplingFreq::FREQ_48000) {
        Some(48_000)
    } else if mask.contains(SamplingFreq::FREQ_44100) {
        Some(44_100)
    } else if mask.contains(SamplingFreq::FREQ_32000) {
        Some(32_000)
    } else if mask.contains(SamplingFreq::FREQ_16000) {
        Some(16_000)
    } else {
        None
    }
}

fn channel_count(mask: ChannelMode) -> Option<u8> {
    if mask.contains(ChannelMode::MONO) {
        Some(1)
    } else if mask
        .intersects(ChannelMode::DUAL_CHANNEL | ChannelMode::STEREO | ChannelMode::JOINT_STEREO)
    {
        Some(2)
    } else {
        None
    }
}

/// Decoded shape of one direction of PCM carried by an A2DP transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PcmShape {
    pub format: SampleFormat,
    pub channels: u8,
    pub sampling_hz: u32,
}

/// FastStream carries independent music (sink) and voice (source) PCM
/// shapes in the same configuration blob.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FastStreamShape {
    pub music: PcmShape,
    pub voice: Option<PcmShape>,
}

fn default_format_for(codec: A2dpCodecId) -> SampleFormat {
    match codec {
        A2dpCodecId::AptXHd => SampleFormat::S24_4Le,
        A2dpCodecId::Ldac => SampleFormat::S32_4Le,
        _ => SampleFormat::S16_2Le,
    }
}

/// Decode an SBC/MPEG/aptX/aptX-HD/LDAC configuration blob into the PCM
/// shape the daemon configures its PCM endpoint with.
///
/// The first configuration byte is always `(channel_mode << 4) |
/// sampling_freq`, matching every non-FastStream A2DP codec's layout.
/// Unknown codecs, or a blob too short to contain the first byte, are
/// programming errors per the propagation policy (`UnsupportedCodec`).
pub fn decode_configuration(codec: A2dpCodecId, configuration: &[u8]) -> Result<PcmShape> {
    if codec == A2dpCodecId::FastStream {
        return Err(Error::with_message(
            ErrorKind::UnsupportedCodec,
            "FastStream has an independent music/voice layout; use decode_faststream",
        ));
    }
    let byte = *configuration.get(0).ok_or_else(|| {
        Error::with_message(ErrorKind::UnsupportedCodec, "empty configuration blob")
    })?;
    let freq_mask = SamplingFreq::from_bits_truncate(byte & 0x3f);
    let chan_mask = ChannelMode::from_bits_truncate((byte >> 4) & 0x0f);
    let sampling_hz = highest_freq_hz(freq_mask).ok_or_else(|| {
        Error::with_message(ErrorKind::UnsupportedCodec, "no recognised sampling rate bit")
    })?;
    let channels = channel_count(chan_mask).ok_or_else(|| {
        Error::with_message(ErrorKind::UnsupportedCodec, "no recognised channel mode bit")
    })?;
    Ok(PcmShape {
        format: default_format_for(codec),
        channels,
        sampling_hz,
    })
}

/// Decode a FastStream configuration blob: byte 0 carries the music
/// (sink) sampling rate bits, byte 1 carries the voice (source)
/// sampling rate bits when present. FastStream voice is always mono
/// 16 kHz when enabled.
pub fn decode_faststream(configuration: &[u8]) -> Result<FastStreamShape> {
    let music_byte = *configuration.get(0).ok_or_else(|| {
        Error::with_message(ErrorKind::UnsupportedCodec, "empty FastStream configuration")
    })?;
    let music_freq = SamplingFreq::from_bits_truncate(music_byte & 0x3f);
    let music_hz = highest_freq_hz(music_freq).ok_or_else(|| {
        Error::with_message(ErrorKind::UnsupportedCodec, "FastStream music rate unrecognised")
    })?;
    let music = PcmShape {
        format: SampleFormat::S16_2Le,
        channels: 2,
        sampling_hz: music_hz,
    };
    let voice = match configuration.get(1) {
        Some(&b) if b != 0 => Some(PcmShape {
            format: SampleFormat::S16_2Le,
            channels: 1,
            sampling_hz: 16_000,
        }),
        _ => None,
    };
    Ok(FastStreamShape { music, voice })
}

/// SCO/eSCO voice codecs. `Undefined` covers the pre-negotiation state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScoCodecId {
    Cvsd,
    Msbc,
    Undefined,
}

/// SCO PCM shape is fixed: mono, `S16_2LE`, rate keyed only by codec.
pub fn sco_pcm_shape(codec: ScoCodecId) -> PcmShape {
    let sampling_hz = match codec {
        ScoCodecId::Cvsd => 8_000,
        ScoCodecId::Msbc => 16_000,
        ScoCodecId::Undefined => 0,
    };
    PcmShape {
        format: SampleFormat::S16_2Le,
        channels: 1,
        sampling_hz,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_sbc_joint_stereo_44100() {
        let byte = (ChannelMode::JOINT_STEREO.bits() << 4) | SamplingFreq::FREQ_44100.bits();
        let shape = decode_configuration(A2dpCodecId::Sbc, &[byte]).unwrap();
        assert_eq!(shape.channels, 2);
        assert_eq!(shape.sampling_hz, 44_100);
        assert_eq!(shape.format, SampleFormat::S16_2Le);
    }

    #[test]
    fn aptx_hd_widens_format_to_s24() {
        let byte = (ChannelMode::STEREO.bits() << 4) | SamplingFreq::FREQ_48000.bits();
        let shape = decode_configuration(A2dpCodecId::AptXHd, &[byte]).unwrap();
        assert_eq!(shape.format, SampleFormat::S24_4Le);
    }

    #[test]
    fn ldac_widens_format_to_s32() {
        let byte = (ChannelMode::STEREO.bits() << 4) | SamplingFreq::FREQ_96000.bits();
        let shape = decode_configuration(A2dpCodecId::Ldac, &[byte]).unwrap();
        assert_eq!(shape.format, SampleFormat::S32_4Le);
        assert_eq!(shape.sampling_hz, 96_000);
    }

    #[test]
    fn mono_sbc_decodes_single_channel() {
        let byte = (ChannelMode::MONO.bits() << 4) | SamplingFreq::FREQ_16000.bits();
        let shape = decode_configuration(A2dpCodecId::Sbc, &[byte]).unwrap();
        assert_eq!(shape.channels, 1);
        assert_eq!(shape.sampling_hz, 16_000);
    }

    #[test]
    fn rejects_empty_configuration() {
        assert!(decode_configuration(A2dpCodecId::Sbc, &[]).is_err());
    }

    #[test]
    fn rejects_unrecognised_frequency_bits() {
        let byte = (ChannelMode::STEREO.bits() << 4) | 0u8;
        assert!(decode_configuration(A2dpCodecId::Sbc, &[byte]).is_err());
    }

    #[test]
    fn faststream_voice_present() {
        let shape = decode_faststream(&[SamplingFreq::FREQ_48000.bits(), 0x01]).unwrap();
        assert_eq!(shape.music.sampling_hz, 48_000);
        assert_eq!(shape.music.channels, 2);
        let voice = shape.voice.expect("voice channel present");
        assert_eq!(voice.sampling_hz, 16_000);
        assert_eq!(voice.channels, 1);
    }

    #[test]
    fn faststream_voice_absent() {
        let shape = decode_faststream(&[SamplingFreq::FREQ_44100.bits(), 0x00]).unwrap();
        assert!(shape.voice.is_none());
    }

    #[test]
    fn sco_shapes_are_fixed() {
        assert_eq!(sco_pcm_shape(ScoCodecId::Cvsd).sampling_hz, 8_000);
        assert_eq!(sco_pcm_shape(ScoCodecId::Msbc).sampling_hz, 16_000);
        assert_eq!(sco_pcm_shape(ScoCodecId::Undefined).sampling_hz, 0);
        assert_eq!(sco_pcm_shape(ScoCodecId::Cvsd).channels, 1);
    }
}
