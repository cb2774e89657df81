//! Restricted Lua 5.4 environment. Each session gets a fresh VM with only the
//! pure standard libraries and the capability globals installed.
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use mlua::{
    Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Table, Value,
    Variadic, VmState,
};

use crate::bridge::{LaunchSpec, LogLevel, QueryKey, Resolution, ScriptOutcome};
use crate::core::prelude::*;
use crate::state::Address;
use crate::wire::Color;

use super::capabilities::{Capabilities, Interrupt};
use super::port::SandboxPort;

pub type SharedPort = Rc<RefCell<SandboxPort>>;

/// Base library entries that would let a script load code or poke the
/// collector. `pcall` is replaced rather than removed.
const REMOVED_GLOBALS: &[&str] = &[
    "collectgarbage",
    "dofile",
    "load",
    "loadfile",
    "loadstring",
    "require",
    "xpcall",
];

const TERMINATED: &str = "session terminated";

/// Runs the chunk in `spec` against `port` and reports how it ended.
pub fn execute(spec: &LaunchSpec, port: &SharedPort) -> ScriptOutcome {
    let started = Instant::now();
    let result = build_vm(spec, port).and_then(|lua| run_chunk(&lua, spec));
    let elapsed_ms = as_millis(started.elapsed());
    let halted = port.borrow().is_halted();

    match result {
        _ if halted => ScriptOutcome {
            ok: false,
            result: None,
            error: Some(TERMINATED.to_string()),
            elapsed_ms,
        },
        Ok(result) => ScriptOutcome {
            ok: true,
            result,
            error: None,
            elapsed_ms,
        },
        Err(err) => ScriptOutcome {
            ok: false,
            result: None,
            error: Some(err.to_string()),
            elapsed_ms,
        },
    }
}

fn build_vm(spec: &LaunchSpec, port: &SharedPort) -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::MATH | StdLib::STRING | StdLib::TABLE | StdLib::UTF8,
        LuaOptions::new(),
    )?;

    if spec.memory_limit_bytes > 0 {
        lua.set_memory_limit(spec.memory_limit_bytes)?;
    }

    install_cancel_hook(
        &lua,
        port.borrow().cancel_flag(),
        spec.hook_instruction_interval.max(1),
    );

    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.set(*name, Value::Nil)?;
    }
    install_pcall(&lua, &globals, port)?;
    install_capabilities(&lua, &globals, port)?;

    Ok(lua)
}

/// Raises an error every `interval` instructions once cancel is set, so even
/// a loop without a single call can be stopped.
fn install_cancel_hook(lua: &Lua, cancel: Arc<AtomicBool>, interval: u32) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(interval),
        move |_lua, _debug| {
            if cancel.load(Ordering::Relaxed) {
                Err(mlua::Error::runtime(TERMINATED))
            } else {
                Ok(VmState::Continue)
            }
        },
    );
}

/// `pcall` that catches script errors but never a termination request or an
/// allocation failure.
fn install_pcall(
    lua: &Lua,
    globals: &Table,
    port: &SharedPort,
) -> mlua::Result<()> {
    let port = port.clone();
    let pcall = lua.create_function(
        move |lua, (callable, args): (Function, MultiValue)| {
            match callable.call::<MultiValue>(args) {
                Ok(values) => {
                    let mut out = vec![Value::Boolean(true)];
                    out.extend(values);
                    Ok(MultiValue::from_vec(out))
                }
                Err(err) => {
                    if port.borrow().is_halted()
                        || matches!(err, mlua::Error::MemoryError(_))
                    {
                        return Err(err);
                    }
                    let message = lua.create_string(err.to_string())?;
                    Ok(MultiValue::from_vec(vec![
                        Value::Boolean(false),
                        Value::String(message),
                    ]))
                }
            }
        },
    )?;
    globals.set("pcall", pcall)
}

fn install_capabilities(
    lua: &Lua,
    globals: &Table,
    port: &SharedPort,
) -> mlua::Result<()> {
    let p = port.clone();
    globals.set(
        "peek_pressed",
        lua.create_function(move |_, addr: i64| {
            Ok(p.borrow_mut().peek_pressed(address(addr)))
        })?,
    )?;

    let p = port.clone();
    globals.set(
        "consume_pending_pressed",
        lua.create_function(move |_, addr: i64| {
            Ok(p.borrow_mut().consume_pending_pressed(address(addr)))
        })?,
    )?;

    let p = port.clone();
    globals.set(
        "consume_pending_unpressed",
        lua.create_function(move |_, addr: i64| {
            Ok(p.borrow_mut().consume_pending_unpressed(address(addr)))
        })?,
    )?;

    for (name, key) in [
        ("await_pressed", QueryKey::Pressed),
        ("await_consume_pending_pressed", QueryKey::ConsumePendingPressed),
        (
            "await_consume_pending_unpressed",
            QueryKey::ConsumePendingUnpressed,
        ),
    ] {
        let p = port.clone();
        globals.set(
            name,
            lua.create_function(move |_, addr: i64| {
                p.borrow_mut()
                    .await_query(key, address(addr))
                    .map(Resolution::value)
                    .map_err(interrupt_error)
            })?,
        )?;
    }

    let p = port.clone();
    globals.set(
        "set_color",
        lua.create_function(move |_, (addr, color): (i64, Table)| {
            let color = color_from_table(&color)?;
            p.borrow_mut().set_color(address(addr), color);
            Ok(())
        })?,
    )?;

    let p = port.clone();
    globals.set(
        "set_color_range",
        lua.create_function(move |_, (start, colors): (i64, Table)| {
            let colors = colors
                .sequence_values::<Table>()
                .map(|entry| entry.and_then(|table| color_from_table(&table)))
                .collect::<mlua::Result<Vec<Color>>>()?;
            p.borrow_mut()
                .set_color_range(address(start), colors)
                .map_err(mlua::Error::external)
        })?,
    )?;

    let p = port.clone();
    globals.set(
        "log",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let mut values: Vec<Value> = values.iter().cloned().collect();
            let level: Option<LogLevel> = match values.first() {
                Some(Value::String(s)) => s.to_string_lossy().parse().ok(),
                _ => None,
            };
            if level.is_some() {
                values.remove(0);
            }
            let line = join_values(lua, values)?;
            p.borrow_mut().log(level.unwrap_or_default(), line);
            Ok(())
        })?,
    )?;

    let p = port.clone();
    globals.set(
        "print",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let line = join_values(lua, values.iter().cloned())?;
            p.borrow_mut().log(LogLevel::Log, line);
            Ok(())
        })?,
    )?;

    let p = port.clone();
    globals.set(
        "notify_user",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let text = join_values(lua, values.iter().cloned())?;
            p.borrow_mut().notify_user(text);
            Ok(())
        })?,
    )?;

    let p = port.clone();
    globals.set(
        "sleep",
        lua.create_function(move |_, ms: Option<i64>| {
            let ms = u64::try_from(ms.unwrap_or(0)).unwrap_or(0);
            p.borrow_mut().sleep(millis(ms)).map_err(interrupt_error)
        })?,
    )?;

    let p = port.clone();
    globals.set(
        "now_ms",
        lua.create_function(move |_, ()| Ok(p.borrow().now_ms()))?,
    )?;

    Ok(())
}

fn run_chunk(lua: &Lua, spec: &LaunchSpec) -> mlua::Result<Option<String>> {
    let values: MultiValue = lua
        .load(spec.source.as_str())
        .set_name(format!("={}", spec.name))
        .eval()?;

    match values.into_iter().next() {
        None | Some(Value::Nil) => Ok(None),
        Some(value) => {
            let tostring: Function = lua.globals().get("tostring")?;
            tostring.call::<String>(value).map(Some)
        }
    }
}

fn address(value: i64) -> Address {
    (value & 0xff) as Address
}

fn channel(value: Option<i64>) -> u8 {
    (value.unwrap_or(0) & 0xff) as u8
}

/// `{r, g, b}` or `{r = .., g = .., b = ..}`; missing channels are 0.
fn color_from_table(table: &Table) -> mlua::Result<Color> {
    let component = |index: i64, name: &str| -> mlua::Result<u8> {
        let by_index: Option<i64> = table.get(index)?;
        let value = match by_index {
            Some(value) => Some(value),
            None => table.get(name)?,
        };
        Ok(channel(value))
    };

    Ok(Color::new(
        component(1, "r")?,
        component(2, "g")?,
        component(3, "b")?,
    ))
}

fn join_values(
    lua: &Lua,
    values: impl IntoIterator<Item = Value>,
) -> mlua::Result<String> {
    let tostring: Function = lua.globals().get("tostring")?;
    let parts = values
        .into_iter()
        .map(|value| tostring.call::<String>(value))
        .collect::<mlua::Result<Vec<String>>>()?;
    Ok(parts.join(" "))
}

fn interrupt_error(interrupt: Interrupt) -> mlua::Error {
    match interrupt {
        Interrupt::Terminated => mlua::Error::runtime(TERMINATED),
        Interrupt::Link(err) => mlua::Error::external(err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::bridge::{HostMessage, RunnerMessage};
    use crate::state::{ButtonRecord, EdgeKind};
    use crate::wire::Command;

    fn spec(source: &str) -> LaunchSpec {
        let mut pressed = ButtonRecord::default();
        pressed.apply_level(true);

        LaunchSpec {
            name: "test".to_string(),
            source: source.to_string(),
            snapshot: vec![(1, pressed)],
            rpc_timeout_ms: 50,
            memory_limit_bytes: 0,
            hook_instruction_interval: 1000,
        }
    }

    fn shared_port(
        spec: &LaunchSpec,
    ) -> (
        SharedPort,
        mpsc::Sender<HostMessage>,
        mpsc::Receiver<RunnerMessage>,
    ) {
        let (host_tx, host_rx) = mpsc::channel();
        let (runner_tx, runner_rx) = mpsc::channel();
        let port = SandboxPort::new(
            spec,
            Box::new(host_rx),
            Box::new(runner_tx),
            Arc::new(AtomicBool::new(false)),
        );
        (Rc::new(RefCell::new(port)), host_tx, runner_rx)
    }

    fn run(source: &str) -> (ScriptOutcome, Vec<RunnerMessage>) {
        let spec = spec(source);
        let (port, _host, runner) = shared_port(&spec);
        let outcome = execute(&spec, &port);
        (outcome, runner.try_iter().collect())
    }

    #[test]
    fn return_value_becomes_result() {
        let (outcome, _) = run("return 40 + 2");
        assert!(outcome.ok);
        assert_eq!(outcome.result.as_deref(), Some("42"));
    }

    #[test]
    fn uncaught_error_fails_the_session() {
        let (outcome, _) = run("error('boom')");
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("boom"));
    }

    #[test]
    fn ambient_host_access_is_absent() {
        let (outcome, _) = run(
            "return io == nil and os == nil and load == nil \
             and require == nil and dofile == nil and debug == nil \
             and coroutine == nil and package == nil",
        );
        assert_eq!(outcome.result.as_deref(), Some("true"));
    }

    #[test]
    fn set_color_masks_to_bytes() {
        let (outcome, messages) = run("set_color(257, {300, 2})");
        assert!(outcome.ok);
        assert!(messages.contains(&RunnerMessage::Emit(Command::SetOne {
            addr: 1,
            color: Color::new(44, 2, 0),
        })));
    }

    #[test]
    fn set_color_range_emits_one_command() {
        let (outcome, messages) =
            run("set_color_range(4, {{1, 2, 3}, {r = 9}})");
        assert!(outcome.ok);
        assert!(messages.contains(&RunnerMessage::Emit(Command::SetRange {
            start: 4,
            colors: vec![Color::new(1, 2, 3), Color::new(9, 0, 0)],
        })));
    }

    #[test]
    fn empty_range_is_a_script_fault() {
        let (outcome, _) = run("set_color_range(0, {})");
        assert!(!outcome.ok);
    }

    #[test]
    fn consume_is_one_shot_and_notifies() {
        let (outcome, messages) = run(
            "return consume_pending_pressed(1) \
             and not consume_pending_pressed(1) and peek_pressed(1)",
        );
        assert_eq!(outcome.result.as_deref(), Some("true"));
        assert!(messages.contains(&RunnerMessage::Consumed {
            addr: 1,
            kind: EdgeKind::Rise,
            upto: 1,
        }));
    }

    #[test]
    fn print_and_log_forward_lines() {
        let (_, messages) = run("print('hi', 1) log('warn', 'careful')");
        assert!(messages.contains(&RunnerMessage::Log {
            level: LogLevel::Log,
            line: "hi 1".to_string(),
        }));
        assert!(messages.contains(&RunnerMessage::Log {
            level: LogLevel::Warn,
            line: "careful".to_string(),
        }));
    }

    #[test]
    fn pcall_still_catches_script_errors() {
        let (outcome, _) = run(
            "local ok, err = pcall(error, 'boom') \
             return tostring(ok) .. ' ' .. tostring(err)",
        );
        let result = outcome.result.unwrap();
        assert!(result.starts_with("false"));
        assert!(result.contains("boom"));
    }

    #[test]
    fn unanswered_await_resolves_to_default() {
        let (outcome, _) = run("return await_pressed(1)");
        assert_eq!(outcome.result.as_deref(), Some("false"));
    }

    #[test]
    fn memory_limit_stops_runaway_allocation() {
        let mut spec = spec(
            "local t = {} \
             for i = 1, 1e7 do t[i] = string.rep('x', 64) .. i end",
        );
        spec.memory_limit_bytes = 1 << 20;
        let (port, _host, _runner) = shared_port(&spec);
        let outcome = execute(&spec, &port);
        assert!(!outcome.ok);
    }

    fn terminate_after(source: &str, delay: Duration) -> ScriptOutcome {
        let spec = spec(source);
        let (port, _host, _runner) = shared_port(&spec);
        let cancel = port.borrow().cancel_flag();

        let canceller = thread::spawn(move || {
            thread::sleep(delay);
            cancel.store(true, Ordering::Relaxed);
        });

        let outcome = execute(&spec, &port);
        canceller.join().unwrap();
        outcome
    }

    #[test]
    fn busy_loop_is_preempted() {
        let outcome = terminate_after("while true do end", millis(50));
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some(TERMINATED));
    }

    #[test]
    fn pcall_cannot_swallow_termination() {
        let outcome = terminate_after(
            "while true do pcall(function() while true do end end) end",
            millis(50),
        );
        assert_eq!(outcome.error.as_deref(), Some(TERMINATED));
    }

    #[test]
    fn sleep_is_preempted() {
        let outcome = terminate_after("sleep(60000)", millis(50));
        assert!(outcome.elapsed_ms < 5_000);
        assert_eq!(outcome.error.as_deref(), Some(TERMINATED));
    }
}
