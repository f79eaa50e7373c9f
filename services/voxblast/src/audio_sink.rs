//! Output side of the service: one clip at a time on a cpal stream.

use crate::config::OUTPUT_CHUNK_SIZE;
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FrameCount, StreamConfig};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use voxblast_core::collaborators::{AudioSink, AudioStream, StreamControl, StreamEnd};
use voxblast_native_utils::audio::{TTS_PCM16_SAMPLE_RATE, decode_pcm16, fan_out, resample};

fn lock(playhead: &Mutex<Playhead>) -> MutexGuard<'_, Playhead> {
    playhead.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Clip {
    id: u64,
    /// Interleaved for the device's channel count.
    samples: Vec<f32>,
    position: usize,
    volume: f32,
    done: Option<oneshot::Sender<StreamEnd>>,
}

/// The clip currently loaded into the output callback.
#[derive(Default)]
pub struct Playhead {
    next_id: u64,
    clip: Option<Clip>,
}

impl Playhead {
    /// Replaces whatever was playing. The replaced clip's end is never reported.
    pub fn load(&mut self, samples: Vec<f32>, volume: f32, done: oneshot::Sender<StreamEnd>) -> u64 {
        self.next_id += 1;
        self.clip = Some(Clip {
            id: self.next_id,
            samples,
            position: 0,
            volume,
            done: Some(done),
        });
        self.next_id
    }

    pub fn set_volume(&mut self, id: u64, volume: f32) {
        if let Some(clip) = self.clip.as_mut().filter(|clip| clip.id == id) {
            clip.volume = volume;
        }
    }

    pub fn halt(&mut self, id: u64) {
        if self.clip.as_ref().is_some_and(|clip| clip.id == id) {
            self.clip = None;
        }
    }

    pub fn fail(&mut self, reason: String) {
        if let Some(mut clip) = self.clip.take() {
            if let Some(done) = clip.done.take() {
                let _ = done.send(StreamEnd::Failed(reason));
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.clip.is_some()
    }

    /// Output callback body. Pads with silence once the clip runs out.
    pub fn fill(&mut self, out: &mut [f32]) {
        let Some(clip) = self.clip.as_mut() else {
            out.fill(0.0);
            return;
        };

        let available = clip.samples.len() - clip.position;
        let n = available.min(out.len());
        for (dst, src) in out[..n]
            .iter_mut()
            .zip(&clip.samples[clip.position..clip.position + n])
        {
            *dst = src * clip.volume;
        }
        out[n..].fill(0.0);
        clip.position += n;

        if clip.position >= clip.samples.len() {
            if let Some(done) = clip.done.take() {
                let _ = done.send(StreamEnd::Completed);
            }
            self.clip = None;
        }
    }
}

struct CpalControl {
    id: u64,
    playhead: Arc<Mutex<Playhead>>,
}

impl StreamControl for CpalControl {
    fn set_volume(&self, volume: f32) {
        lock(&self.playhead).set_volume(self.id, volume);
    }

    fn halt(&self) {
        lock(&self.playhead).halt(self.id);
    }
}

/// Plays PCM16 speech on an output device.
///
/// The cpal stream lives on its own thread for as long as the sink exists.
pub struct CpalSink {
    playhead: Arc<Mutex<Playhead>>,
    channels: usize,
    sample_rate: f64,
    _keepalive: std::sync::mpsc::Sender<()>,
}

impl CpalSink {
    pub fn open(device_name: Option<String>) -> Result<Self> {
        let playhead = Arc::new(Mutex::new(Playhead::default()));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(usize, f64)>>();
        let (keepalive, shutdown) = std::sync::mpsc::channel::<()>();

        let shared = playhead.clone();
        std::thread::Builder::new()
            .name("voxblast-audio-out".to_string())
            .spawn(move || match build_output_stream(device_name, shared) {
                Ok((stream, channels, sample_rate)) => {
                    let _ = ready_tx.send(Ok((channels, sample_rate)));
                    // Returns once the sink is dropped.
                    let _ = shutdown.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .context("Failed to spawn audio output thread")?;

        let (channels, sample_rate) = ready_rx
            .recv()
            .context("Audio output thread exited during setup")??;
        Ok(Self {
            playhead,
            channels,
            sample_rate,
            _keepalive: keepalive,
        })
    }
}

fn build_output_stream(
    device_name: Option<String>,
    playhead: Arc<Mutex<Playhead>>,
) -> Result<(cpal::Stream, usize, f64)> {
    let output = voxblast_native_utils::device::get_or_default_output(device_name)
        .context("Failed to get audio output device")?;
    tracing::info!("Using output device: {:?}", &output.name()?);

    // Get the default output configuration.
    let output_config = output
        .default_output_config()
        .context("Failed to get default output config")?;
    // Create a stream config with a fixed buffer size.
    let output_config = StreamConfig {
        channels: output_config.channels(),
        sample_rate: output_config.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(OUTPUT_CHUNK_SIZE as u32)),
    };
    tracing::info!("Output stream config: {:?}", &output_config);
    let channels = output_config.channels as usize;
    let sample_rate = output_config.sample_rate.0 as f64;

    let data_playhead = playhead.clone();
    let stream = output.build_output_stream(
        &output_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| lock(&data_playhead).fill(data),
        move |err| {
            tracing::error!("An error occurred on output stream: {}", err);
            lock(&playhead).fail(err.to_string());
        },
        None,
    )?;
    stream.play()?;
    Ok((stream, channels, sample_rate))
}

impl AudioSink for CpalSink {
    fn play(&self, audio: Vec<u8>, volume: f32) -> Result<AudioStream> {
        let mono = decode_pcm16(&audio);
        let resampled = resample(&mono, TTS_PCM16_SAMPLE_RATE, self.sample_rate)
            .context("Failed to resample speech for the output device")?;
        let samples = fan_out(&resampled, self.channels);

        let (done, ended) = oneshot::channel();
        let id = lock(&self.playhead).load(samples, volume, done);
        Ok(AudioStream {
            control: Arc::new(CpalControl {
                id,
                playhead: self.playhead.clone(),
            }),
            ended,
        })
    }
}
