//! End to end tests against a scripted serial device
//!
//! The mock implements just enough of the bootloader and flasher stub to
//! drive the real connection, detection and flashing code paths: it
//! decodes the host's SLIP frames, answers ROM commands from a register
//! table, accepts a RAM download as "the stub" and then speaks the stub's
//! streaming write protocol, digests included.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use flate2::read::ZlibDecoder;
use md5::{Digest, Md5};

use esploader::{
    error::Error,
    flasher::Flasher,
    interface::SerialInterface,
    targets::Chip,
};

const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

fn slip_encode(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![SLIP_END];
    for byte in payload {
        match *byte {
            SLIP_ESC => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            SLIP_END => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            other => out.push(other),
        }
    }
    out.push(SLIP_END);
    out
}

#[derive(Default)]
struct DeviceState {
    /// Bytes queued for the host to read
    rx: VecDeque<u8>,
    /// Sync attempts to answer with garbage before behaving
    garbled_syncs: usize,
    /// Replies sent per answered sync; the real loader sends 8
    sync_replies: usize,
    /// Answer the whole-transfer digest with the wrong bytes
    corrupt_digest: bool,
    /// Claim progress beyond what was actually sent
    overreport_progress: bool,
    /// Trailing status bytes of every response
    status: Vec<u8>,
    registers: HashMap<u32, u32>,

    /// Data received through the ROM flash download commands
    rom_flash: Vec<u8>,
    /// Compressed data received through the deflate download commands
    defl_flash: Vec<u8>,
    /// Erase sizes from every flash-begin request
    flash_begin_sizes: Vec<u32>,

    // host-to-device SLIP decode state
    frame: Vec<u8>,
    in_frame: bool,
    in_escape: bool,

    stub_running: bool,
    awaiting_write_params: bool,
    /// Raw (unframed) data bytes still expected for the current stub write
    raw_remaining: usize,
    write_addr: u32,
    received: Vec<u8>,
    booted: bool,
}

impl DeviceState {
    fn respond(&mut self, opcode: u8, value: u32, data: &[u8]) {
        let mut frame = vec![1, opcode];
        frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
        frame.extend_from_slice(&value.to_le_bytes());
        frame.extend_from_slice(data);
        self.rx.extend(slip_encode(&frame));
    }

    fn send_packet(&mut self, payload: &[u8]) {
        let encoded = slip_encode(payload);
        self.rx.extend(encoded);
    }

    fn handle_frame(&mut self, frame: Vec<u8>) {
        if self.stub_running {
            self.handle_stub_frame(frame);
            return;
        }

        // request header: direction, opcode, length, checksum
        if frame.len() < 8 || frame[0] != 0 {
            return;
        }
        let opcode = frame[1];
        let payload = frame[8..].to_vec();
        let ok = self.status.clone();

        match opcode {
            // sync
            0x08 => {
                if self.garbled_syncs > 0 {
                    self.garbled_syncs -= 1;
                    // line noise, not a valid frame
                    self.rx.extend([0x00, 0xFF, 0x55, 0x13, 0x37]);
                } else {
                    for _ in 0..self.sync_replies {
                        self.respond(0x08, 0, &ok);
                    }
                }
            }
            // read_reg
            0x0a => {
                let addr =
                    u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                match self.registers.get(&addr).copied() {
                    Some(value) => self.respond(0x0a, value, &ok),
                    None => self.respond(0x0a, 0, &[1, 5]),
                }
            }
            // flash_begin
            0x02 => {
                let size =
                    u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                self.flash_begin_sizes.push(size);
                if size > 0 {
                    self.rom_flash.clear();
                }
                self.respond(0x02, 0, &ok);
            }
            // flash_data: 16 bytes of block params, then the block itself
            0x03 => {
                self.rom_flash.extend_from_slice(&payload[16..]);
                self.respond(0x03, 0, &ok);
            }
            // flash_defl_begin / flash_defl_data
            0x10 => {
                self.defl_flash.clear();
                self.respond(0x10, 0, &ok);
            }
            0x11 => {
                self.defl_flash.extend_from_slice(&payload[16..]);
                self.respond(0x11, 0, &ok);
            }
            // flash_md5: digest what landed in flash, answered as ascii hex
            0x13 => {
                let size =
                    u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]])
                        as usize;
                let image = if self.defl_flash.is_empty() {
                    self.rom_flash[..size].to_vec()
                } else {
                    let mut inflated = Vec::new();
                    ZlibDecoder::new(self.defl_flash.as_slice())
                        .read_to_end(&mut inflated)
                        .unwrap();
                    inflated.truncate(size);
                    inflated
                };
                let hex: String = Md5::digest(&image)
                    .iter()
                    .map(|byte| format!("{:02x}", byte))
                    .collect();
                let mut data = hex.into_bytes();
                data.extend_from_slice(&ok);
                self.respond(0x13, 0, &data);
            }
            // mem_end starts the uploaded image, which the mock treats as
            // the stub becoming live
            0x06 => {
                self.respond(0x06, 0, &ok);
                self.stub_running = true;
                self.send_packet(b"OHAI");
            }
            // everything else succeeds silently
            other => {
                self.respond(other, 0, &ok);
            }
        }
    }

    fn handle_stub_frame(&mut self, frame: Vec<u8>) {
        if self.awaiting_write_params {
            self.awaiting_write_params = false;
            self.write_addr = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
            self.raw_remaining =
                u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
            self.received.clear();
            // initial progress report
            let progress: u32 = if self.overreport_progress {
                0xFFFF_0000
            } else {
                0
            };
            self.send_packet(&progress.to_le_bytes());
            return;
        }

        match frame.as_slice() {
            // flash write
            [1] => self.awaiting_write_params = true,
            // boot firmware
            [6] => {
                self.booted = true;
                self.send_packet(&[0]);
            }
            _ => {}
        }
    }

    fn consume(&mut self, buf: &[u8]) {
        let mut consumed_raw = false;

        for &byte in buf {
            if self.raw_remaining > 0 {
                self.received.push(byte);
                self.raw_remaining -= 1;
                consumed_raw = true;
                continue;
            }

            if !self.in_frame {
                if byte == SLIP_END {
                    self.in_frame = true;
                    self.frame.clear();
                }
                continue;
            }
            if self.in_escape {
                self.in_escape = false;
                match byte {
                    SLIP_ESC_END => self.frame.push(SLIP_END),
                    SLIP_ESC_ESC => self.frame.push(SLIP_ESC),
                    _ => {}
                }
                continue;
            }
            match byte {
                SLIP_ESC => self.in_escape = true,
                SLIP_END => {
                    self.in_frame = false;
                    let frame = std::mem::take(&mut self.frame);
                    self.handle_frame(frame);
                }
                other => self.frame.push(other),
            }
        }

        if consumed_raw {
            // progress report for this burst
            self.send_packet(&(self.received.len() as u32).to_le_bytes());

            if self.raw_remaining == 0 {
                let mut digest = Md5::digest(&self.received).to_vec();
                if self.corrupt_digest {
                    digest[0] ^= 0xFF;
                }
                let status = [0u8];
                self.send_packet(&digest);
                self.send_packet(&status);
            }
        }
    }
}

#[derive(Clone)]
struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
    timeout: Duration,
    baud: u32,
}

impl MockDevice {
    fn new(garbled_syncs: usize) -> Self {
        let mut state = DeviceState::default();
        state.garbled_syncs = garbled_syncs;
        state.sync_replies = 8;
        state.status = vec![0, 0];
        state.registers.insert(0x6000_0078, 0x0006_2000);

        MockDevice {
            state: Arc::new(Mutex::new(state)),
            timeout: Duration::from_secs(3),
            baud: 115_200,
        }
    }

    /// A device with the four-byte status layout and no stub support
    fn new_esp32() -> Self {
        let device = Self::new(0);
        {
            let mut state = device.state.lock().unwrap();
            state.status = vec![0, 0, 0, 0];
            state.registers.insert(0x6000_0078, 0x1512_2500);
        }
        device
    }

    fn state(&self) -> Arc<Mutex<DeviceState>> {
        Arc::clone(&self.state)
    }
}

impl Read for MockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.rx.is_empty() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let mut n = 0;
        while n < buf.len() {
            match state.rx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for MockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().unwrap().consume(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialInterface for MockDevice {
    fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud: u32) -> serialport::Result<()> {
        self.baud = baud;
        Ok(())
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        Ok(self.baud)
    }

    fn write_request_to_send(&mut self, _level: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn write_data_terminal_ready(&mut self, _level: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn discard_input(&mut self) -> serialport::Result<()> {
        self.state.lock().unwrap().rx.clear();
        Ok(())
    }
}

#[test]
fn detects_chip_despite_garbled_syncs() {
    let device = MockDevice::new(4);
    let flasher = Flasher::connect(device).unwrap();

    assert_eq!(flasher.chip(), Chip::Esp8266);
    assert_eq!(flasher.profile().status_bytes_len, 2);
}

#[test]
fn connect_fails_when_every_sync_is_garbled() {
    // more garbled responses than the 4x4 attempt budget
    let device = MockDevice::new(64);
    assert!(Flasher::connect(device).is_err());
}

#[test]
fn connect_fails_when_sync_echoes_go_missing() {
    let device = MockDevice::new(0);
    // one reply per sync instead of the full echo burst
    device.state().lock().unwrap().sync_replies = 1;

    assert!(Flasher::connect(device).is_err());
}

#[test]
fn stub_write_flash_end_to_end() {
    let device = MockDevice::new(0);
    let state = device.state();

    let mut flasher = Flasher::connect(device).unwrap();
    assert_eq!(flasher.chip(), Chip::Esp8266);

    let data: Vec<u8> = (0..3 * 4096u32).map(|i| (i % 251) as u8).collect();
    flasher.write_flash(0x2000, &data, None, false).unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.write_addr, 0x2000);
    assert_eq!(state.received, data);
    assert!(state.booted);
}

#[test]
fn stub_write_detects_digest_mismatch() {
    let device = MockDevice::new(0);
    device.state().lock().unwrap().corrupt_digest = true;

    let mut flasher = Flasher::connect(device).unwrap();

    let data = vec![0xA5u8; 4096];
    match flasher.write_flash(0x0000, &data, None, false) {
        Err(Error::DigestMismatch { .. }) => {}
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn stub_write_rejects_overreported_progress() {
    let device = MockDevice::new(0);
    device.state().lock().unwrap().overreport_progress = true;

    let mut flasher = Flasher::connect(device).unwrap();

    let data = vec![0x5Au8; 4096];
    match flasher.write_flash(0x1000, &data, None, false) {
        Err(Error::UnexpectedPacket { .. }) => {}
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn esp32_rom_write_erases_whole_blocks() {
    let device = MockDevice::new_esp32();
    let state = device.state();

    let mut flasher = Flasher::connect(device).unwrap();
    assert_eq!(flasher.chip(), Chip::Esp32);

    let data: Vec<u8> = (0..1000u32).map(|i| (i % 239) as u8).collect();
    flasher.write_flash(0x1000, &data, None, false).unwrap();

    let state = state.lock().unwrap();
    // a 1000 byte image still erases one full 0x400 byte block
    assert_eq!(state.flash_begin_sizes.first(), Some(&0x400));
    assert_eq!(&state.rom_flash[..data.len()], data.as_slice());
}

#[test]
fn esp32_compressed_write_round_trips() {
    let device = MockDevice::new_esp32();
    let state = device.state();

    let mut flasher = Flasher::connect(device).unwrap();

    let data: Vec<u8> = (0..4096u32).map(|i| (i % 13) as u8).collect();
    flasher.write_flash(0x1000, &data, None, true).unwrap();

    let state = state.lock().unwrap();
    let mut inflated = Vec::new();
    ZlibDecoder::new(state.defl_flash.as_slice())
        .read_to_end(&mut inflated)
        .unwrap();
    assert_eq!(inflated, data);
}

#[test]
fn unaligned_stub_write_is_rejected_up_front() {
    let device = MockDevice::new(0);
    let mut flasher = Flasher::connect(device).unwrap();

    let mut stub = esploader::flasher::StubFlasher::start(&mut flasher, None).unwrap();
    match stub.flash_write(0x2001, &vec![0u8; 4096]) {
        Err(Error::UnalignedFlashOperation { .. }) => {}
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}
