//! TCP link to the pad hardware. A reader thread turns the socket into
//! control events; the write half goes to the supervisor.
use std::io::{ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::prelude::*;
use crate::error::PadError;
use crate::supervisor::{ControlEvent, ControlSender};

const READ_BUFFER_SIZE: usize = 4096;

pub struct TcpLink {
    stream: TcpStream,
    peer: SocketAddr,
    reader_handle: Option<JoinHandle<()>>,
}

impl TcpLink {
    pub fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        control_tx: ControlSender,
    ) -> Result<Self, PadError> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::from_stream(stream, control_tx),
                Err(err) => {
                    debug!("connect to {} failed: {}", addr, err);
                    last_error = Some(err);
                }
            }
        }

        Err(PadError::ConnectionLost(match last_error {
            Some(err) => format!("{}:{}: {}", host, port, err),
            None => format!("{}:{} did not resolve", host, port),
        }))
    }

    pub fn from_stream(
        stream: TcpStream,
        control_tx: ControlSender,
    ) -> Result<Self, PadError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let reader = stream.try_clone()?;

        let reader_handle = thread::Builder::new()
            .name("padlink-wire-reader".to_string())
            .spawn(move || read_loop(reader, control_tx))?;

        info!("connected to {}", peer);

        Ok(Self {
            stream,
            peer,
            reader_handle: Some(reader_handle),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// An independent handle to the socket for the supervisor to write to.
    pub fn writer(&self) -> Result<TcpStream, PadError> {
        Ok(self.stream.try_clone()?)
    }

    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(mut stream: TcpStream, control_tx: ControlSender) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    let reason = loop {
        match stream.read(&mut buffer) {
            Ok(0) => break "closed by peer".to_string(),
            Ok(n) => {
                trace!("read {} bytes", n);
                let event = ControlEvent::Received(buffer[..n].to_vec());
                if control_tx.send(event).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => break err.to_string(),
        }
    };

    debug!("wire reader stopping: {}", reason);
    let _ = control_tx.send(ControlEvent::Disconnected(reason));
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;

    use serial_test::serial;

    use super::*;
    use crate::supervisor::control_channel;

    #[test]
    #[serial]
    fn forwards_bytes_then_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = control_channel();

        let _link =
            TcpLink::connect("127.0.0.1", port, millis(1000), tx).unwrap();
        let (mut device, _) = listener.accept().unwrap();
        device.write_all(&[3, 1]).unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            match rx.recv_timeout(millis(2000)).unwrap() {
                ControlEvent::Received(bytes) => received.extend(bytes),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(received, vec![3, 1]);

        drop(device);
        assert!(matches!(
            rx.recv_timeout(millis(2000)).unwrap(),
            ControlEvent::Disconnected(_)
        ));
    }

    #[test]
    #[serial]
    fn refused_connection_is_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, _rx) = control_channel();
        assert!(matches!(
            TcpLink::connect("127.0.0.1", port, millis(500), tx),
            Err(PadError::ConnectionLost(_))
        ));
    }
}
