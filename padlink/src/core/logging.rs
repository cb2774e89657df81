use env_logger::{Builder, Env};
use log::{Level, LevelFilter, Record};
use std::io::Write;
use termcolor::{Color, ColorSpec, WriteColor};

pub use log::{debug, error, info, trace, warn};

/// Log target used for lines emitted by user scripts.
pub const SCRIPT_TARGET: &str = "padlink::script";

/// Installs the `[LEVEL][origin] message` stderr logger. `RUST_LOG`
/// overrides the `padlink=info` default; script lines can be filtered on
/// their own with `padlink::script=...`.
pub fn init_logger() {
    let mut builder =
        Builder::from_env(Env::default().default_filter_or("padlink=info"));
    builder.filter_module("mio", LevelFilter::Warn);
    builder.filter_module("notify", LevelFilter::Warn);

    builder.format(|_buf, record| {
        let writer =
            termcolor::BufferWriter::stderr(termcolor::ColorChoice::Auto);
        let mut buffer = writer.buffer();

        buffer.set_color(ColorSpec::new().set_fg(Some(level_color(
            record.level(),
        ))))?;
        write!(buffer, "[{}][{}]", record.level(), origin(record))?;
        buffer.reset()?;
        writeln!(buffer, " {}", record.args())?;
        writer.print(&buffer)?;
        Ok(())
    });

    let _ = builder.try_init();
}

fn level_color(level: Level) -> Color {
    match level {
        Level::Trace => Color::Cyan,
        Level::Debug => Color::Blue,
        Level::Info => Color::Green,
        Level::Warn => Color::Yellow,
        Level::Error => Color::Red,
    }
}

/// The target, which is the module path unless a line was sent to an
/// explicit target such as [`SCRIPT_TARGET`].
fn origin<'a>(record: &'a Record<'a>) -> &'a str {
    record.target()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_lines_show_script_target() {
        let record = Record::builder()
            .args(format_args!("hello"))
            .target(SCRIPT_TARGET)
            .module_path(Some("padlink::supervisor"))
            .build();
        assert_eq!(origin(&record), SCRIPT_TARGET);
    }

    #[test]
    fn engine_lines_show_module_path() {
        let record = Record::builder()
            .args(format_args!("hello"))
            .target("padlink::supervisor")
            .module_path(Some("padlink::supervisor"))
            .build();
        assert_eq!(origin(&record), "padlink::supervisor");
    }
}
