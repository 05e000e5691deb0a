use audiopus::{Application, Bitrate, Channels, SampleRate, coder::Encoder as OpusEncoder};
use bytes::Bytes;

use crate::{
    audio::constants::{FRAME_SIZE_SAMPLES, MAX_OPUS_PACKET},
    configs::EncoderPreset,
};

/// PCM i16 -> Opus encoder for 20 ms stereo frames at 48 kHz.
pub struct FrameEncoder {
    encoder: OpusEncoder,
    out: Vec<u8>,
}

impl FrameEncoder {
    pub fn new(preset: EncoderPreset) -> Result<Self, audiopus::Error> {
        let mut encoder =
            OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(preset.bitrate))?;
        if preset.fec {
            encoder.enable_inband_fec()?;
        } else {
            encoder.disable_inband_fec()?;
        }
        encoder.set_packet_loss_perc(preset.packet_loss_percent)?;

        Ok(Self {
            encoder,
            out: vec![0; MAX_OPUS_PACKET],
        })
    }

    /// Encodes one interleaved frame of [`FRAME_SIZE_SAMPLES`] samples.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, audiopus::Error> {
        debug_assert_eq!(pcm.len(), FRAME_SIZE_SAMPLES);
        let len = self.encoder.encode(pcm, &mut self.out)?;
        Ok(Bytes::copy_from_slice(&self.out[..len]))
    }
}
