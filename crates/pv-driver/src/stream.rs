//! cpal output driver
//!
//! Owns the device stream on a dedicated playback thread so the driver
//! itself stays `Send`; the cpal callback pulls whole pages from the
//! service and fans them out to the device's sample format and channel
//! count.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig, SupportedStreamConfig};

use crate::{DriverConfig, DriverError, DriverResult, PcmDriver, PcmService};

/// PCM driver backed by the default cpal output device.
pub struct CpalDriver {
    device: Option<Device>,
    supported: Option<SupportedStreamConfig>,
    playback: Option<Playback>,
}

struct Playback {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl CpalDriver {
    pub fn new() -> Self {
        Self { device: None, supported: None, playback: None }
    }
}

impl Default for CpalDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl PcmDriver for CpalDriver {
    fn init(&mut self, config: &mut DriverConfig) -> DriverResult<()> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(DriverError::NoDevice)?;

        let supported = pick_output_config(&device, config)?;

        // Adopt what the device actually gave us.
        config.mix_rate = supported.sample_rate();
        config.channels = supported.channels().clamp(1, 2);

        self.device = Some(device);
        self.supported = Some(supported);
        Ok(())
    }

    fn begin_playback(&mut self, service: Box<dyn PcmService>) -> DriverResult<()> {
        if self.playback.is_some() {
            return Err(DriverError::AlreadyStarted);
        }
        let device = self.device.clone().ok_or(DriverError::NotInitialized)?;
        let supported = self.supported.clone().ok_or(DriverError::NotInitialized)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let (ready_tx, ready_rx) = mpsc::channel::<DriverResult<()>>();

        // The cpal stream is not Send, so it lives and dies on this thread.
        let thread = thread::spawn(move || {
            let stream = match build_output_stream(&device, &supported, service) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(DriverError::StreamError(e.to_string())));
                return;
            }

            let _ = ready_tx.send(Ok(()));

            while !thread_stop.load(Ordering::Acquire) {
                thread::park_timeout(Duration::from_millis(50));
            }

            // Dropping the stream stops callbacks before the thread exits.
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.playback = Some(Playback { stop, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DriverError::StreamBuildError("playback thread died".into()))
            }
        }
    }

    fn stop_playback(&mut self) {
        if let Some(playback) = self.playback.take() {
            playback.stop.store(true, Ordering::Release);
            playback.thread.thread().unpark();
            // Joining guarantees the stream is gone and no service call is
            // still in flight.
            let _ = playback.thread.join();
        }
    }

    fn shutdown(&mut self) {
        self.stop_playback();
        self.supported = None;
        self.device = None;
    }
}

fn pick_output_config(
    device: &Device,
    config: &DriverConfig,
) -> DriverResult<SupportedStreamConfig> {
    let requested_rate: SampleRate = config.mix_rate;
    let channels = config.channels;

    let configs = device
        .supported_output_configs()
        .map_err(|e| DriverError::ConfigError(e.to_string()))?;

    let mut fallback = None;

    for supported in configs {
        if supported.sample_format() != SampleFormat::F32 {
            continue;
        }
        if supported.channels() == channels
            && supported.min_sample_rate() <= requested_rate
            && supported.max_sample_rate() >= requested_rate
        {
            return Ok(supported.with_sample_rate(requested_rate));
        }
        if fallback.is_none() && supported.channels() >= 1 {
            fallback = Some(supported.with_max_sample_rate());
        }
    }

    fallback.ok_or_else(|| {
        DriverError::ConfigError(format!(
            "no f32 output config for {} channels @ {}Hz",
            channels, config.mix_rate
        ))
    })
}

fn build_output_stream(
    device: &Device,
    supported: &SupportedStreamConfig,
    mut service: Box<dyn PcmService>,
) -> DriverResult<cpal::Stream> {
    let device_channels = supported.channels() as usize;
    let page_samples = service.page_samples();

    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    // One page of mixed output, refilled whenever the cursor runs off the
    // end. cpal callback sizes need not align with page boundaries.
    let mut page = vec![0i16; page_samples];
    let mut cursor = page_samples;

    let mix_channels = service.channels() as usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(device_channels) {
                    if cursor + mix_channels > page_samples {
                        service.render_next(&mut page);
                        cursor = 0;
                    }

                    let left = page[cursor] as f32 / 32768.0;
                    let right = if mix_channels == 2 {
                        page[cursor + 1] as f32 / 32768.0
                    } else {
                        left
                    };
                    cursor += mix_channels;

                    for (ch, sample) in frame.iter_mut().enumerate() {
                        *sample = if ch % 2 == 0 { left } else { right };
                    }
                }
            },
            move |err| {
                log::error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| DriverError::StreamBuildError(e.to_string()))?;

    Ok(stream)
}
