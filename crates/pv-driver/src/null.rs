//! Offline driver
//!
//! No device, no thread: the caller clocks the mixer by pumping pages out
//! of a [`NullPump`]. Tests and headless rendering both use this.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{DriverConfig, DriverError, DriverResult, PcmDriver, PcmService};

type ServiceSlot = Arc<Mutex<Option<Box<dyn PcmService>>>>;

/// Driver that accepts whatever rate and channel count is requested and
/// plays nothing. Service calls happen only when the paired [`NullPump`]
/// is driven.
pub struct NullDriver {
    slot: ServiceSlot,
}

/// The caller's side of a [`NullDriver`]: each [`NullPump::render`] is one
/// service tick.
pub struct NullPump {
    slot: ServiceSlot,
}

impl NullDriver {
    pub fn new() -> (Self, NullPump) {
        let slot: ServiceSlot = Arc::new(Mutex::new(None));
        (Self { slot: Arc::clone(&slot) }, NullPump { slot })
    }
}

impl PcmDriver for NullDriver {
    fn init(&mut self, _config: &mut DriverConfig) -> DriverResult<()> {
        Ok(())
    }

    fn begin_playback(&mut self, service: Box<dyn PcmService>) -> DriverResult<()> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(DriverError::AlreadyStarted);
        }
        *slot = Some(service);
        Ok(())
    }

    fn stop_playback(&mut self) {
        // Taking the slot lock waits out an in-flight pump call.
        self.slot.lock().take();
    }

    fn shutdown(&mut self) {}
}

impl NullPump {
    /// Mix one page into `out`. Returns false once playback has stopped.
    pub fn render(&self, out: &mut [i16]) -> bool {
        let mut slot = self.slot.lock();
        match slot.as_mut() {
            Some(service) => {
                service.render_next(out);
                true
            }
            None => false,
        }
    }

    /// Interleaved i16 values per page, while playback is running.
    pub fn page_samples(&self) -> Option<usize> {
        self.slot.lock().as_ref().map(|s| s.page_samples())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingService {
        pages: usize,
        page_samples: usize,
    }

    impl PcmService for CountingService {
        fn render_next(&mut self, out: &mut [i16]) {
            self.pages += 1;
            out.fill(self.pages as i16);
        }

        fn page_samples(&self) -> usize {
            self.page_samples
        }

        fn channels(&self) -> u16 {
            2
        }
    }

    #[test]
    fn test_pump_clocks_service() {
        let (mut driver, pump) = NullDriver::new();
        let mut config = DriverConfig { mix_rate: 44100, channels: 2 };
        driver.init(&mut config).unwrap();
        assert_eq!(config.channels, 2);

        driver
            .begin_playback(Box::new(CountingService { pages: 0, page_samples: 8 }))
            .unwrap();
        assert_eq!(pump.page_samples(), Some(8));

        let mut out = [0i16; 8];
        assert!(pump.render(&mut out));
        assert_eq!(out, [1; 8]);
        assert!(pump.render(&mut out));
        assert_eq!(out, [2; 8]);

        driver.stop_playback();
        assert!(!pump.render(&mut out));
        assert_eq!(pump.page_samples(), None);
    }

    #[test]
    fn test_double_start_rejected() {
        let (mut driver, _pump) = NullDriver::new();
        driver
            .begin_playback(Box::new(CountingService { pages: 0, page_samples: 4 }))
            .unwrap();
        let again = driver.begin_playback(Box::new(CountingService {
            pages: 0,
            page_samples: 4,
        }));
        assert!(matches!(again, Err(DriverError::AlreadyStarted)));
    }
}
