//! A stand-in for the pad hardware: listens on TCP, paints host commands onto
//! a [`Board`] and sends press/release signals back.
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::board::{Board, Cell};
use crate::core::prelude::*;
use crate::error::PadError;
use crate::state::Address;
use crate::wire::{
    Command, DEFAULT_CONFLICT_THRESHOLD, conflict_heartbeat, decode_commands,
    encode_signal,
};

pub struct SimDevice {
    listener: TcpListener,
    board: Arc<Mutex<Board>>,
    changed: Arc<AtomicBool>,
    stream: Option<TcpStream>,
    reader_handle: Option<JoinHandle<()>>,
}

impl SimDevice {
    /// Port 0 picks a free port; see [`SimDevice::local_addr`].
    pub fn bind(port: u16, pads: usize) -> Result<Self, PadError> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        info!("simulated device listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            board: Arc::new(Mutex::new(Board::with_pads(pads))),
            changed: Arc::new(AtomicBool::new(false)),
            stream: None,
            reader_handle: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, PadError> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until a host connects. A previous host is dropped.
    pub fn accept(&mut self) -> Result<SocketAddr, PadError> {
        self.disconnect();

        let (stream, peer) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;

        let board = self.board.clone();
        let changed = self.changed.clone();
        self.reader_handle = Some(thread::spawn(move || {
            read_commands(reader, board, changed);
        }));
        self.stream = Some(stream);

        info!("host connected from {}", peer);
        Ok(peer)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn press(&mut self, addr: Address) -> Result<(), PadError> {
        self.send_signal(addr, true)
    }

    pub fn release(&mut self, addr: Address) -> Result<(), PadError> {
        self.send_signal(addr, false)
    }

    pub fn send_signal(
        &mut self,
        addr: Address,
        pressed: bool,
    ) -> Result<(), PadError> {
        self.board.lock().apply_signal(addr, pressed);
        self.write(&encode_signal(addr, pressed))
    }

    /// Announces that another host holds the device.
    pub fn conflict(&mut self) -> Result<(), PadError> {
        self.write(&conflict_heartbeat(DEFAULT_CONFLICT_THRESHOLD))
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), PadError> {
        let stream = self.stream.as_mut().ok_or(PadError::NotConnected)?;
        stream.write_all(bytes)?;
        trace!("sim tx {}", hex_string(bytes));
        Ok(())
    }

    pub fn board(&self) -> Board {
        self.board.lock().clone()
    }

    pub fn cell(&self, addr: Address) -> Option<Cell> {
        self.board.lock().cell(addr).copied()
    }

    /// True once per batch of color changes since the last call.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }

    /// Polls until `predicate` holds for the board or `timeout` passes.
    pub fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl Fn(&Board) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.board.lock()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(millis(5));
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn read_commands(
    mut stream: TcpStream,
    board: Arc<Mutex<Board>>,
    changed: Arc<AtomicBool>,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 1024];

    loop {
        let n = match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("sim reader stopping: {}", err);
                break;
            }
        };
        pending.extend_from_slice(&buffer[..n]);

        let (commands, used) = take_commands(&pending);
        pending.drain(..used);
        if commands.is_empty() {
            continue;
        }

        let mut board = board.lock();
        for command in &commands {
            board.apply_command(command);
        }
        changed.store(true, Ordering::SeqCst);
    }

    info!("host disconnected");
}

/// Decodes the whole commands at the front of `bytes` and returns them with
/// the number of bytes used. A malformed frame (zero count) is skipped by
/// itself; a partial trailing command is left for the next read.
fn take_commands(bytes: &[u8]) -> (Vec<Command>, usize) {
    let mut commands = Vec::new();
    let mut offset = 0;

    while let Some(&count) = bytes.get(offset + 1) {
        let end = offset + 2 + count as usize * 3;
        if end > bytes.len() {
            break;
        }
        match decode_commands(&bytes[offset..end]) {
            Ok(mut decoded) => commands.append(&mut decoded),
            Err(err) => warn!("sim dropping malformed command: {}", err),
        }
        offset = end;
    }

    (commands, offset)
}
