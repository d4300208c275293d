//! Strategies for resetting the chip via the serial control lines
//!
//! Development boards wire RTS to the chip enable pin and DTR to GPIO0, so
//! pulsing them in the right order restarts the chip with the boot-strap
//! pin held low and drops it into the serial bootloader.

use std::{thread::sleep, time::Duration};

use crate::{error::ConnectionError, interface::SerialInterface};

/// A way of resetting the attached chip
pub trait ResetStrategy {
    fn reset(&self, serial: &mut dyn SerialInterface) -> Result<(), ConnectionError>;

    fn set_dtr(
        &self,
        serial: &mut dyn SerialInterface,
        level: bool,
    ) -> Result<(), ConnectionError> {
        serial.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(
        &self,
        serial: &mut dyn SerialInterface,
        level: bool,
    ) -> Result<(), ConnectionError> {
        serial.write_request_to_send(level)?;
        Ok(())
    }
}

/// Classic DTR/RTS dance for boards with the usual transistor pair
///
/// RTS and DTR are active low at the chip, so "true" here pulls the line
/// down.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset;

impl ResetStrategy for ClassicReset {
    fn reset(&self, serial: &mut dyn SerialInterface) -> Result<(), ConnectionError> {
        self.set_dtr(serial, false)?; // IO0 = HIGH
        self.set_rts(serial, true)?; // EN = LOW, chip in reset
        sleep(Duration::from_millis(50));
        self.set_dtr(serial, true)?; // IO0 = LOW
        self.set_rts(serial, false)?; // EN = HIGH, chip out of reset
        sleep(Duration::from_millis(50));
        self.set_dtr(serial, false)?; // IO0 = HIGH, done strapping

        Ok(())
    }
}

/// Plain reset without touching GPIO0, used to boot the freshly flashed
/// firmware.
#[derive(Debug, Clone, Copy)]
pub struct HardReset;

impl ResetStrategy for HardReset {
    fn reset(&self, serial: &mut dyn SerialInterface) -> Result<(), ConnectionError> {
        self.set_rts(serial, true)?;
        sleep(Duration::from_millis(100));
        self.set_rts(serial, false)?;

        Ok(())
    }
}
