//! Microphone capture using PulseAudio
//!
//! The simple API is blocking, so each acquired microphone gets its own
//! thread that owns the record stream. The thread reads fixed-size frames of
//! 16-bit mono PCM and hands them to the session's [`FrameSink`].

use crate::config::LiveConfig;
use crate::devices::{CaptureDevice, CaptureError, CaptureStream};
use crate::events::FrameSink;
use async_trait::async_trait;
use libpulse_binding as pulse;
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::Retval;
use libpulse_binding::error::{Code, PAErr};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_simple_binding as psimple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Map a PulseAudio error from opening a record stream.
pub(crate) fn capture_error(e: PAErr, device: Option<&str>) -> CaptureError {
    let code = e.0.abs();
    let device = device.unwrap_or("default source");
    if code == Code::Access as i32 {
        CaptureError::PermissionDenied(format!("{}: {}", device, e))
    } else if code == Code::NoEntity as i32 {
        CaptureError::NoDevicesFound
    } else {
        CaptureError::Device(format!("{}: {}", device, e))
    }
}

/// The PulseAudio microphone
pub struct PulseMicrophone {
    app_name: String,
    device: Option<String>,
    sample_rate: u32,
    frame_samples: usize,
}

impl PulseMicrophone {
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            app_name: config.app_name.clone(),
            device: config.input_device.clone(),
            sample_rate: config.input_sample_rate,
            frame_samples: config.frame_samples,
        }
    }

    fn open(&self) -> Result<psimple::Simple, CaptureError> {
        let spec = pulse::sample::Spec {
            format: pulse::sample::Format::S16le,
            channels: 1,
            rate: self.sample_rate,
        };
        if !spec.is_valid() {
            return Err(CaptureError::Device(format!(
                "invalid capture format: {} Hz mono",
                self.sample_rate
            )));
        }

        psimple::Simple::new(
            None,
            &self.app_name,
            pulse::stream::Direction::Record,
            self.device.as_deref(),
            "microphone",
            &spec,
            None,
            None,
        )
        .map_err(|e| capture_error(e, self.device.as_deref()))
    }
}

#[async_trait]
impl CaptureDevice for PulseMicrophone {
    async fn acquire(&self) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (sink_tx, sink_rx) = mpsc::channel::<FrameSink>();
        let running = Arc::new(AtomicBool::new(false));

        let mic = PulseMicrophone {
            app_name: self.app_name.clone(),
            device: self.device.clone(),
            sample_rate: self.sample_rate,
            frame_samples: self.frame_samples,
        };
        let running_thread = running.clone();

        std::thread::Builder::new()
            .name("livevoice-capture".to_string())
            .spawn(move || {
                let capture = match mic.open() {
                    Ok(capture) => {
                        let _ = ready_tx.send(Ok(()));
                        capture
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                info!(
                    "Microphone connected ({}, {} Hz)",
                    mic.device.as_deref().unwrap_or("default"),
                    mic.sample_rate
                );
                capture_loop(capture, sink_rx, running_thread, mic.frame_samples);
                debug!("Microphone released");
            })?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(PulseCapture {
                sinks: Some(sink_tx),
                running,
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CaptureError::Device(
                "capture thread exited before opening the device".to_string(),
            )),
        }
    }
}

/// Wait for a sink, then read frames into it until disconnected.
///
/// Returns once the stream handle is dropped, which closes the record stream.
fn capture_loop(
    capture: psimple::Simple,
    sinks: mpsc::Receiver<FrameSink>,
    running: Arc<AtomicBool>,
    frame_samples: usize,
) {
    let mut bytes = vec![0u8; frame_samples * 2];

    while let Ok(sink) = sinks.recv() {
        debug!("Capture started");
        while running.load(Ordering::SeqCst) {
            if let Err(e) = capture.read(&mut bytes) {
                error!("Failed to read audio: {}", e);
                sink.failed(format!("microphone read failed: {}", e));
                return;
            }
            let pcm: Vec<i16> = bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            if !sink.push(pcm) {
                warn!("Session gone, stopping capture");
                running.store(false, Ordering::SeqCst);
            }
        }
        debug!("Capture disconnected");
    }
}

/// An acquired PulseAudio record stream
pub struct PulseCapture {
    sinks: Option<mpsc::Sender<FrameSink>>,
    running: Arc<AtomicBool>,
}

impl CaptureStream for PulseCapture {
    fn start(&mut self, sink: FrameSink) {
        let Some(sinks) = self.sinks.as_ref() else {
            return;
        };
        self.running.store(true, Ordering::SeqCst);
        if sinks.send(sink).is_err() {
            warn!("Capture thread has exited; no frames will be delivered");
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn disconnect(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn release(self: Box<Self>) {
        // Drop does the work
    }
}

impl Drop for PulseCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Closing the channel ends the capture thread
        self.sinks.take();
    }
}

/// Which side of the sound server to list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Sources, including monitors of outputs
    Input,
    /// Sinks
    Output,
}

/// A PulseAudio source or sink
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Monitor of a sink rather than a real input
    pub is_monitor: bool,
}

fn list_error(msg: impl Into<String>) -> CaptureError {
    CaptureError::Device(msg.into())
}

fn wait_for(mainloop: &mut Mainloop, done: &AtomicBool) -> Result<(), CaptureError> {
    while !done.load(Ordering::SeqCst) {
        if !matches!(mainloop.iterate(true), IterateResult::Success(_)) {
            return Err(list_error("mainloop iterate failed"));
        }
    }
    Ok(())
}

/// List the server's sources or sinks.
pub fn list_devices(kind: DeviceKind) -> Result<Vec<AudioDevice>, CaptureError> {
    let mut proplist = Proplist::new().ok_or_else(|| list_error("failed to create proplist"))?;
    proplist
        .set_str(properties::APPLICATION_NAME, "livevoice-device-lister")
        .map_err(|_| list_error("failed to set application name"))?;

    let mut mainloop = Mainloop::new().ok_or_else(|| list_error("failed to create mainloop"))?;
    let mut context = Context::new_with_proplist(&mainloop, "livevoice-context", &proplist)
        .ok_or_else(|| list_error("failed to create context"))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| capture_error(e, None))?;

    loop {
        if !matches!(mainloop.iterate(true), IterateResult::Success(_)) {
            return Err(list_error("mainloop iterate failed"));
        }
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(list_error("could not connect to the sound server"));
            }
            _ => {}
        }
    }

    let devices = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));
    let introspector = context.introspect();

    match kind {
        DeviceKind::Input => {
            let (list, finished) = (devices.clone(), done.clone());
            let _op = introspector.get_source_info_list(move |result| match result {
                ListResult::Item(info) => {
                    let name = info.name.as_deref().unwrap_or_default().to_string();
                    let is_monitor = info.monitor_of_sink.is_some() || name.contains("monitor");
                    if let Ok(mut list) = list.lock() {
                        list.push(AudioDevice {
                            description: info
                                .description
                                .as_deref()
                                .unwrap_or(name.as_str())
                                .to_string(),
                            name,
                            sample_rate: info.sample_spec.rate,
                            channels: info.sample_spec.channels,
                            is_monitor,
                        });
                    }
                }
                ListResult::End => finished.store(true, Ordering::SeqCst),
                ListResult::Error => {
                    error!("Error listing input devices");
                    finished.store(true, Ordering::SeqCst);
                }
            });
            wait_for(&mut mainloop, &done)?;
        }
        DeviceKind::Output => {
            let (list, finished) = (devices.clone(), done.clone());
            let _op = introspector.get_sink_info_list(move |result| match result {
                ListResult::Item(info) => {
                    let name = info.name.as_deref().unwrap_or_default().to_string();
                    if let Ok(mut list) = list.lock() {
                        list.push(AudioDevice {
                            description: info
                                .description
                                .as_deref()
                                .unwrap_or(name.as_str())
                                .to_string(),
                            name,
                            sample_rate: info.sample_spec.rate,
                            channels: info.sample_spec.channels,
                            is_monitor: false,
                        });
                    }
                }
                ListResult::End => finished.store(true, Ordering::SeqCst),
                ListResult::Error => {
                    error!("Error listing output devices");
                    finished.store(true, Ordering::SeqCst);
                }
            });
            wait_for(&mut mainloop, &done)?;
        }
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let devices = devices
        .lock()
        .map_err(|_| list_error("device list lock poisoned"))?
        .clone();
    Ok(devices)
}
