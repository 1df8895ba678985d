use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::CaptureError;

use super::controller::{AudioChunk, AudioSource, CaptureHints, CHUNK_FRAME_MS};

/// Microphone source backed by cpal. Device and config selection happen on
/// the caller's thread so acquisition failures surface synchronously; the
/// stream itself lives on a dedicated thread because cpal streams are not
/// Send.
pub struct CpalSource;

impl AudioSource for CpalSource {
    fn open(
        &self,
        hints: &CaptureHints,
        sink: broadcast::Sender<AudioChunk>,
        cancel: CancellationToken,
    ) -> Result<(), CaptureError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(CaptureError::DeviceUnavailable)?;

        info!("audio input device: {}", device.name().unwrap_or_default());

        // Prefer the hinted rate, then the other rates speech providers accept.
        let target_rates = [hints.sample_rate, 48_000, 16_000, 32_000, 8_000];
        let mut selected = None;
        let mut selected_rate = 0;
        for &rate in &target_rates {
            let configs = device
                .supported_input_configs()
                .map_err(|e| CaptureError::Stream(e.to_string()))?;
            for range in configs {
                if range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate {
                    selected = Some(range.with_sample_rate(cpal::SampleRate(rate)));
                    selected_rate = rate;
                    break;
                }
            }
            if selected.is_some() {
                break;
            }
        }

        let config = match selected {
            Some(c) => c,
            None => {
                let def = device
                    .default_input_config()
                    .map_err(|_| CaptureError::DeviceUnavailable)?;
                selected_rate = def.sample_rate().0;
                def
            }
        };

        info!(
            "audio config selected: rate={}Hz channels={}",
            selected_rate,
            config.channels()
        );

        let rate = selected_rate;
        std::thread::spawn(move || {
            if let Err(e) = run_stream(device, config, rate, sink, cancel) {
                error!("capture stream terminated: {}", e);
            }
        });
        Ok(())
    }
}

fn run_stream(
    device: cpal::Device,
    config: cpal::SupportedStreamConfig,
    rate: u32,
    sink: broadcast::Sender<AudioChunk>,
    cancel: CancellationToken,
) -> Result<(), CaptureError> {
    let rb = HeapRb::<f32>::new(rate as usize);
    let (mut producer, mut consumer) = rb.split();

    let err_fn = |err| error!("an error occurred on stream: {}", err);

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => device
            .build_input_stream(
                &config.into(),
                move |data: &[f32], _: &_| {
                    // If the ring is full we drop input (lossy by contract)
                    producer.push_slice(data);
                },
                err_fn,
                None,
            )
            .map_err(|e| CaptureError::Stream(e.to_string()))?,
        cpal::SampleFormat::I16 => device
            .build_input_stream(
                &config.into(),
                move |data: &[i16], _: &_| {
                    for &sample in data {
                        let _ = producer.try_push(sample as f32 / i16::MAX as f32);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| CaptureError::Stream(e.to_string()))?,
        _ => return Err(CaptureError::UnsupportedFormat),
    };

    stream.play().map_err(|e| CaptureError::Stream(e.to_string()))?;

    // Framer: pop full frames off the ring and fan them out as chunks.
    let frame_size = (rate as usize * CHUNK_FRAME_MS as usize) / 1000;
    let mut frame = vec![0.0f32; frame_size];
    let started = Instant::now();
    let mut seq = 0u64;

    while !cancel.is_cancelled() {
        if consumer.occupied_len() < frame_size {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }
        let _ = consumer.pop_slice(&mut frame);

        let mut data = Vec::with_capacity(frame_size * 2);
        for &sample in &frame {
            let s = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            data.extend_from_slice(&s.to_le_bytes());
        }

        seq += 1;
        let _ = sink.send(AudioChunk {
            seq,
            timestamp_ms: started.elapsed().as_millis() as u64,
            data,
        });
    }

    // Stream dropped here releases the hardware device
    drop(stream);
    Ok(())
}
