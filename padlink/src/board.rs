//! Non-visual model of the pad grid an operator front-end shows: one cell per
//! bound address with its last color and button state.
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::core::prelude::*;
use crate::error::{CodecError, PadError};
use crate::state::{Address, ButtonState};
use crate::wire::{Color, Command, decode_commands};

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct Cell {
    pub addr: Address,
    pub color: Color,
    pub state: ButtonState,
}

#[derive(Clone, Debug, Default)]
pub struct Board {
    cells: Vec<Cell>,
    index: HashMap<Address, usize>,
}

impl Board {
    /// One cell per address, in order. Duplicates are rejected.
    pub fn new(
        addrs: impl IntoIterator<Item = Address>,
    ) -> Result<Self, PadError> {
        let mut board = Self::default();
        for addr in addrs {
            if board.index.contains_key(&addr) {
                return Err(PadError::AddressConflict(addr));
            }
            board.index.insert(addr, board.cells.len());
            board.cells.push(Cell {
                addr,
                ..Cell::default()
            });
        }
        Ok(board)
    }

    /// Pads addressed `0..count`.
    pub fn with_pads(count: usize) -> Self {
        let mut board = Self::default();
        for addr in (0..=u8::MAX).take(count) {
            board.index.insert(addr, board.cells.len());
            board.cells.push(Cell {
                addr,
                ..Cell::default()
            });
        }
        board
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, addr: Address) -> Option<&Cell> {
        self.index.get(&addr).map(|&i| &self.cells[i])
    }

    fn cell_mut(&mut self, addr: Address) -> Option<&mut Cell> {
        match self.index.get(&addr) {
            Some(&i) => self.cells.get_mut(i),
            None => {
                trace!("no pad bound to address {}", addr);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn apply_command(&mut self, command: &Command) {
        for (addr, color) in command.expand() {
            if let Some(cell) = self.cell_mut(addr) {
                cell.color = color;
            }
        }
    }

    /// Applies host → device bytes. Returns how many commands they held.
    pub fn apply_tx(&mut self, bytes: &[u8]) -> Result<usize, CodecError> {
        let commands = decode_commands(bytes)?;
        for command in &commands {
            self.apply_command(command);
        }
        Ok(commands.len())
    }

    pub fn apply_signal(&mut self, addr: Address, pressed: bool) {
        if let Some(cell) = self.cell_mut(addr) {
            cell.state.pressed = pressed;
        }
    }

    pub fn apply_state(&mut self, addr: Address, state: ButtonState) {
        if let Some(cell) = self.cell_mut(addr) {
            cell.state = state;
        }
    }

    /// Every button back to released with no pending flags. Colors stay.
    pub fn reset(&mut self) {
        for cell in &mut self.cells {
            cell.state = ButtonState::default();
        }
    }

    /// Points the cell at `position` to `addr`. Rejected if another cell
    /// already uses `addr`.
    pub fn rebind(
        &mut self,
        position: usize,
        addr: Address,
    ) -> Result<(), PadError> {
        let Some(current) = self.cells.get(position).map(|c| c.addr) else {
            return Err(PadError::Config(format!(
                "no pad at position {}",
                position
            )));
        };
        if current == addr {
            return Ok(());
        }
        if self.index.contains_key(&addr) {
            return Err(PadError::AddressConflict(addr));
        }

        self.index.remove(&current);
        self.index.insert(addr, position);
        self.cells[position] = Cell {
            addr,
            ..Cell::default()
        };
        Ok(())
    }

    /// Text grid, `columns` cells per row. Pressed pads are marked `*`,
    /// pending rises `^` and pending falls `v`.
    pub fn render(&self, columns: usize) -> String {
        let mut out = String::new();
        for row in self.cells.chunks(columns.max(1)) {
            let line = row
                .iter()
                .map(|cell| {
                    let mut marks = String::new();
                    marks.push(ternary!(cell.state.pressed, '*', ' '));
                    marks.push(ternary!(cell.state.pending_pressed, '^', ' '));
                    marks.push(ternary!(
                        cell.state.pending_unpressed,
                        'v',
                        ' '
                    ));
                    format!("{:>3} {}{}", cell.addr, cell.color, marks)
                })
                .collect::<Vec<_>>()
                .join(" ");
            let _ = writeln!(out, "{}", line.trim_end());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{encode_set_one, encode_set_range};

    #[test]
    fn duplicate_addresses_conflict() {
        assert!(matches!(
            Board::new([1, 2, 1]),
            Err(PadError::AddressConflict(1))
        ));
    }

    #[test]
    fn transmitted_commands_paint_cells() {
        let mut board = Board::with_pads(8);
        let red = Color::new(255, 0, 0);
        let blue = Color::new(0, 0, 255);

        let mut bytes = encode_set_one(1, red).to_vec();
        bytes.extend(encode_set_range(5, 2, &[blue, blue]).unwrap());
        assert_eq!(board.apply_tx(&bytes), Ok(2));

        assert_eq!(board.cell(1).unwrap().color, red);
        assert_eq!(board.cell(5).unwrap().color, blue);
        assert_eq!(board.cell(6).unwrap().color, blue);
        assert_eq!(board.cell(7).unwrap().color, Color::BLACK);
    }

    #[test]
    fn commands_for_unbound_addresses_are_ignored() {
        let mut board = Board::with_pads(2);
        board.apply_command(&Command::SetOne {
            addr: 40,
            color: Color::new(1, 1, 1),
        });
        assert!(board.cells().iter().all(|c| c.color == Color::BLACK));
    }

    #[test]
    fn rebind_rejects_taken_address() {
        let mut board = Board::with_pads(4);
        assert!(matches!(
            board.rebind(0, 3),
            Err(PadError::AddressConflict(3))
        ));
        board.rebind(0, 200).unwrap();
        assert!(board.cell(0).is_none());
        assert_eq!(board.cell(200).map(|c| c.addr), Some(200));
        board.rebind(1, 0).unwrap();
    }

    #[test]
    fn reset_keeps_colors() {
        let mut board = Board::with_pads(1);
        board.apply_command(&Command::SetOne {
            addr: 0,
            color: Color::new(9, 9, 9),
        });
        board.apply_signal(0, true);
        board.reset();
        let cell = board.cell(0).unwrap();
        assert!(!cell.state.pressed);
        assert_eq!(cell.color, Color::new(9, 9, 9));
    }

    #[test]
    fn render_marks_pressed_pads() {
        let mut board = Board::with_pads(2);
        board.apply_signal(1, true);
        let text = board.render(2);
        assert_eq!(text, "  0 #000000      1 #000000*\n");
    }
}
