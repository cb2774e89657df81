use std::env;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, TryRecvError};

use chrono::Local;
use log::{info, warn};
use padlink::core::util::{hex_string, millis, parse_hex_bytes};
use padlink::sandbox::RunnerCommand;
use padlink::sandbox::unit::RUNNER_ENV;
use padlink::supervisor::host_event_channel;
use padlink::watch::ScriptWatch;
use padlink::{
    Board, Config, ConnectionStatus, ControlEvent, ExecutionMode, HostEvent,
    OperatorCommand, Supervisor, TcpLink,
};

use crate::{parse_addr, stdin_lines};

pub struct RunArgs {
    pub script: PathBuf,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub mode: Option<ExecutionMode>,
    pub watch: bool,
    pub json: bool,
    pub pads: usize,
}

pub fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let mut config = Config::resolve(args.config.as_deref())?;
    if let Some(host) = args.host.clone() {
        config.link.host = host;
    }
    if let Some(port) = args.port {
        config.link.port = port;
    }
    if let Some(mode) = args.mode {
        config.supervisor.execution = mode;
    }

    let (host_tx, host_rx) = host_event_channel();
    let mut supervisor = Supervisor::new(config.supervisor.clone(), host_tx);

    if config.supervisor.runner_path.is_none()
        && env::var_os(RUNNER_ENV).is_none()
    {
        let exe = env::current_exe()?;
        supervisor.set_runner(RunnerCommand::new(exe).with_args(&["runner"]));
    }

    let link = TcpLink::connect(
        &config.link.host,
        config.link.port,
        millis(config.link.connect_timeout_ms),
        supervisor.control_sender(),
    )?;
    supervisor.attach_wire(Box::new(link.writer()?));

    let watch = if args.watch {
        Some(ScriptWatch::start(args.script.clone())?)
    } else {
        None
    };

    let mut console = Console {
        board: Board::with_pads(args.pads),
        json: args.json,
        lost: false,
    };

    start_script(&mut supervisor, &args.script);

    let lines = stdin_lines();
    let mut stdin_open = true;

    loop {
        if !supervisor.poll(millis(20)) {
            break;
        }

        for event in host_rx.try_iter() {
            console.show(&event);
        }
        if console.lost {
            return Err("connection lost".into());
        }

        if stdin_open {
            match next_line(&lines) {
                Ok(Some(line)) => {
                    let script = &args.script;
                    if !console.handle_line(&mut supervisor, script, &line) {
                        break;
                    }
                }
                Ok(None) => {}
                Err(()) => stdin_open = false,
            }
        }

        if watch.as_ref().is_some_and(ScriptWatch::take_changed) {
            info!("script changed; restarting");
            supervisor.stop_active();
            start_script(&mut supervisor, &args.script);
        }

        let idle = supervisor.active_session().is_none();
        if !stdin_open && watch.is_none() && idle {
            break;
        }
    }

    supervisor.stop_active();
    for event in host_rx.try_iter() {
        console.show(&event);
    }
    drop(link);
    Ok(())
}

fn next_line(lines: &Receiver<String>) -> Result<Option<String>, ()> {
    match lines.try_recv() {
        Ok(line) => Ok(Some(line)),
        Err(TryRecvError::Empty) => Ok(None),
        Err(TryRecvError::Disconnected) => Err(()),
    }
}

fn script_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn start_script(supervisor: &mut Supervisor, path: &Path) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            warn!("failed to read '{}': {}", path.display(), err);
            return;
        }
    };

    supervisor.handle_event(ControlEvent::Operator(OperatorCommand::Start {
        name: script_name(path),
        source,
    }));
}

struct Console {
    board: Board,
    json: bool,
    lost: bool,
}

impl Console {
    fn show(&mut self, event: &HostEvent) {
        self.mirror(event);

        if self.json {
            match event.to_json() {
                Ok(line) => println!("{}", line),
                Err(err) => warn!("failed to encode event: {}", err),
            }
            return;
        }

        let Some(text) = describe(event) else {
            return;
        };
        println!("{} {}", Local::now().format("%H:%M:%S%.3f"), text);
    }

    fn mirror(&mut self, event: &HostEvent) {
        match event {
            HostEvent::Transmitted { bytes } => {
                if let Err(err) = self.board.apply_tx(bytes) {
                    warn!("board mirror: {}", err);
                }
            }
            HostEvent::PendingUpdated { addr, state } => {
                self.board.apply_state(*addr, *state);
            }
            HostEvent::ButtonsReset => self.board.reset(),
            HostEvent::ConnectionStatus {
                status: ConnectionStatus::Disconnected(_),
            } => self.lost = true,
            _ => {}
        }
    }

    /// Returns false when the operator asked to quit.
    fn handle_line(
        &mut self,
        supervisor: &mut Supervisor,
        script: &Path,
        line: &str,
    ) -> bool {
        let mut tokens = line.split_whitespace();
        let command = match tokens.next() {
            Some("stop") => Ok(Some(OperatorCommand::Stop)),
            Some("rerun") => {
                supervisor.stop_active();
                start_script(supervisor, script);
                Ok(None)
            }
            Some("press") => parse_addr(tokens.next()).map(|addr| {
                Some(OperatorCommand::Simulate {
                    addr,
                    pressed: true,
                })
            }),
            Some("release") => parse_addr(tokens.next()).map(|addr| {
                Some(OperatorCommand::Simulate {
                    addr,
                    pressed: false,
                })
            }),
            Some("send") => {
                let rest = tokens.collect::<Vec<_>>().join(" ");
                parse_hex_bytes(&rest)
                    .map(|bytes| Some(OperatorCommand::SendRaw(bytes)))
            }
            Some("board") => {
                print!("{}", self.board.render(4));
                Ok(None)
            }
            Some("quit") => Ok(Some(OperatorCommand::Shutdown)),
            Some(other) => Err(format!(
                "unknown command '{}' (stop, rerun, press N, release N, \
                 send HEX.., board, quit)",
                other
            )),
            None => Ok(None),
        };

        match command {
            Ok(Some(command)) => {
                supervisor.handle_event(ControlEvent::Operator(command))
            }
            Ok(None) => true,
            Err(err) => {
                warn!("{}", err);
                true
            }
        }
    }
}

fn describe(event: &HostEvent) -> Option<String> {
    let text = match event {
        HostEvent::Received { bytes } => format!("rx {}", hex_string(bytes)),
        HostEvent::Transmitted { bytes } => {
            format!("tx {}", hex_string(bytes))
        }
        HostEvent::ScriptLog {
            session,
            level,
            line,
        } => format!("{} [{}] {}", session, level, line),
        HostEvent::Notify { session, text } => {
            format!("{} notice: {}", session, text)
        }
        HostEvent::Conflict => "device is in use elsewhere".to_string(),
        HostEvent::PendingUpdated { .. } => return None,
        HostEvent::ButtonsReset => "all buttons reset".to_string(),
        HostEvent::ConnectionStatus { status } => match status {
            ConnectionStatus::Connected => "connected".to_string(),
            ConnectionStatus::Disconnected(reason) => {
                format!("disconnected: {}", reason)
            }
        },
        HostEvent::SessionStarted { session, name } => {
            format!("{} started: {}", session, name)
        }
        HostEvent::SessionFinished { session, outcome } => {
            let detail = outcome
                .error
                .as_deref()
                .or(outcome.result.as_deref())
                .map(|d| format!(": {}", d))
                .unwrap_or_default();
            format!(
                "{} {} after {} ms{}",
                session, outcome.state, outcome.elapsed_ms, detail
            )
        }
    };
    Some(text)
}
