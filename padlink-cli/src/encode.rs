use std::error::Error;

use clap::Subcommand;
use padlink::core::util::hex_string;
use padlink::wire::{Color, encode_set_one, encode_set_range};

#[derive(Subcommand)]
pub enum EncodeCommand {
    /// Set a single pad: ADDR R G B
    One { addr: u8, r: u8, g: u8, b: u8 },
    /// Set consecutive pads: START R,G,B [R,G,B ...]
    Range {
        start: u8,
        #[arg(required = true)]
        colors: Vec<String>,
    },
}

pub fn encode(command: EncodeCommand) -> Result<(), Box<dyn Error>> {
    let bytes = match command {
        EncodeCommand::One { addr, r, g, b } => {
            encode_set_one(addr, Color::new(r, g, b)).to_vec()
        }
        EncodeCommand::Range { start, colors } => {
            let colors = colors
                .iter()
                .map(|c| parse_color(c))
                .collect::<Result<Vec<_>, _>>()?;
            encode_set_range(start, colors.len(), &colors)?
        }
    };

    println!("{}", hex_string(&bytes));
    Ok(())
}

fn parse_color(text: &str) -> Result<Color, String> {
    let channels = text
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u8>()
                .map_err(|err| {
                    format!("invalid channel in '{}': {}", text, err)
                })
        })
        .collect::<Result<Vec<u8>, String>>()?;

    match channels.as_slice() {
        [r, g, b] => Ok(Color::new(*r, *g, *b)),
        _ => Err(format!("expected R,G,B but got '{}'", text)),
    }
}
