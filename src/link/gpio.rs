//! A signal link over four `embedded-hal` pins, for hosts that expose the TAP on GPIOs.
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin, PinState};

use crate::error::{Error, Result};
use crate::link::{Link, SignalLink};

pub struct Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    half_period: u32,
    delay: Delay,
    clock: Clk,
    tdi: Tdi,
    tdo: Tdo,
    tms: Tms,
    clock_high: bool,
    open: bool,
}

fn pin_error<E: embedded_hal::digital::Error>(pin: &str, e: E) -> Error {
    Error::Transport(alloc::format!("GPIO {pin}: {:?}", e.kind()))
}

impl<Clk, Tdi, Tdo, Tms, Delay> Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    /// `freq_khz` is the TCK frequency; every edge is followed by half a period of delay.
    pub fn new(freq_khz: u32, clock: Clk, tdi: Tdi, tdo: Tdo, tms: Tms, delay: Delay) -> Gpio<Clk, Tdi, Tdo, Tms, Delay> {
        let period_ns = 1_000_000 / freq_khz.max(1);
        let half_period = period_ns / 2;
        Gpio { half_period, clock, tdi, tdo, tms, delay, clock_high: false, open: false }
    }

    /// Hand the pins back.
    pub fn release(self) -> (Clk, Tdi, Tdo, Tms) {
        (self.clock, self.tdi, self.tdo, self.tms)
    }
}

impl<Clk, Tdi, Tdo, Tms, Delay> Link for Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    fn open(&mut self) -> Result<()> {
        // clock starts low
        self.clock.set_low().map_err(|e| pin_error("TCK", e))?;
        self.clock_high = false;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl<Clk, Tdi, Tdo, Tms, Delay> SignalLink for Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    fn set_signal(&mut self, tms: bool, tck: bool, tdi: bool) -> Result<()> {
        if !self.open {
            return Err(Error::Transport("GPIO link is not open".into()));
        }
        self.tms.set_state(PinState::from(tms)).map_err(|e| pin_error("TMS", e))?;
        self.tdi.set_state(PinState::from(tdi)).map_err(|e| pin_error("TDI", e))?;
        if tck != self.clock_high {
            self.clock.set_state(PinState::from(tck)).map_err(|e| pin_error("TCK", e))?;
            self.clock_high = tck;
            self.delay.delay_ns(self.half_period);
        }
        Ok(())
    }

    fn get_signal(&mut self) -> Result<bool> {
        self.tdo.is_high().map_err(|e| pin_error("TDO", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::RefCell;
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType;

    #[derive(Clone, Default)]
    struct Trace(Rc<RefCell<Vec<(&'static str, bool)>>>);

    struct Out(&'static str, Trace);

    impl ErrorType for Out {
        type Error = Infallible;
    }

    impl OutputPin for Out {
        fn set_low(&mut self) -> core::result::Result<(), Infallible> {
            self.1.0.borrow_mut().push((self.0, false));
            Ok(())
        }

        fn set_high(&mut self) -> core::result::Result<(), Infallible> {
            self.1.0.borrow_mut().push((self.0, true));
            Ok(())
        }
    }

    struct In(bool);

    impl ErrorType for In {
        type Error = Infallible;
    }

    impl InputPin for In {
        fn is_high(&mut self) -> core::result::Result<bool, Infallible> {
            Ok(self.0)
        }

        fn is_low(&mut self) -> core::result::Result<bool, Infallible> {
            Ok(!self.0)
        }
    }

    struct NoDelay(Rc<RefCell<u32>>);

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, ns: u32) {
            *self.0.borrow_mut() += ns;
        }
    }

    #[test]
    fn clock_edges_only_when_tck_changes() {
        let trace = Trace::default();
        let waited = Rc::new(RefCell::new(0));
        let mut gpio = Gpio::new(
            1000,
            Out("tck", trace.clone()),
            Out("tdi", trace.clone()),
            In(true),
            Out("tms", trace.clone()),
            NoDelay(waited.clone()),
        );
        assert!(gpio.set_signal(true, false, false).is_err());
        gpio.open().unwrap();
        trace.0.borrow_mut().clear();

        gpio.set_signal(true, false, false).unwrap();
        gpio.set_signal(true, true, false).unwrap();
        assert_eq!(
            *trace.0.borrow(),
            [("tms", true), ("tdi", false), ("tms", true), ("tdi", false), ("tck", true)]
        );
        assert_eq!(*waited.borrow(), 500);
        assert!(gpio.get_signal().unwrap());
    }
}
