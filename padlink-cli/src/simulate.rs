use std::error::Error;
use std::sync::mpsc::RecvTimeoutError;

use log::{info, warn};
use padlink::SimDevice;
use padlink::core::util::millis;

use crate::{parse_addr, stdin_lines};

pub fn simulate(
    port: u16,
    pads: usize,
    columns: usize,
) -> Result<(), Box<dyn Error>> {
    let mut device = SimDevice::bind(port, pads)?;
    println!("waiting for a host on {}", device.local_addr()?);
    device.accept()?;

    let lines = stdin_lines();
    print!("{}", device.board().render(columns));

    loop {
        match lines.recv_timeout(millis(50)) {
            Ok(line) => {
                if !handle_line(&mut device, &line, columns) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if device.take_changed() {
            print!("{}", device.board().render(columns));
        }
    }

    info!("simulator stopped");
    Ok(())
}

fn handle_line(device: &mut SimDevice, line: &str, columns: usize) -> bool {
    let mut tokens = line.split_whitespace();
    let result = match tokens.next() {
        Some("press") => parse_addr(tokens.next())
            .and_then(|addr| device.press(addr).map_err(|e| e.to_string())),
        Some("release") => parse_addr(tokens.next())
            .and_then(|addr| device.release(addr).map_err(|e| e.to_string())),
        Some("conflict") => device.conflict().map_err(|e| e.to_string()),
        Some("board") => {
            print!("{}", device.board().render(columns));
            Ok(())
        }
        Some("quit") => return false,
        Some(other) => Err(format!(
            "unknown command '{}' (press N, release N, conflict, board, quit)",
            other
        )),
        None => Ok(()),
    };

    if let Err(err) = result {
        warn!("{}", err);
    }
    true
}
