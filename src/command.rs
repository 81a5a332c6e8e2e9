use crossbeam_channel::Sender;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal,
};
use log::warn;
use std::{
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    ToggleAcquisition,
    SoftwareTrigger,
    ToggleContinuousTrigger,
    OneShotPlot,
    TogglePeriodicPlot,
    NextBoard,
    NextChannel,
    Help,
}

pub const HELP: &str = "\
[q] quit
[s] start/stop the acquisition
[t] send a software trigger (single shot)
[T] enable/disable continuous software trigger
[p] plot one event
[P] enable/disable periodic plot
[b] change board to plot
[c] change channel to plot
[space] this help";

pub fn decode_key(code: KeyCode) -> Option<Command> {
    let command = match code {
        KeyCode::Char('q') => Command::Quit,
        KeyCode::Char('s') => Command::ToggleAcquisition,
        KeyCode::Char('t') => Command::SoftwareTrigger,
        KeyCode::Char('T') => Command::ToggleContinuousTrigger,
        KeyCode::Char('p') => Command::OneShotPlot,
        KeyCode::Char('P') => Command::TogglePeriodicPlot,
        KeyCode::Char('b') => Command::NextBoard,
        KeyCode::Char('c') => Command::NextChannel,
        KeyCode::Char(' ') => Command::Help,
        _ => return None,
    };
    Some(command)
}

/// Raw mode for as long as the guard lives.
struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Terminal output that ends every line with `\r\n`.
///
/// Raw mode turns off the terminal's newline translation, so log lines written
/// while the keyboard thread holds it go through this writer.
#[derive(Debug)]
pub struct CrlfWriter<W>(W);

impl<W: Write> CrlfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> W {
        self.0
    }
}

impl<W: Write> Write for CrlfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for line in buf.split_inclusive(|&b| b == b'\n') {
            match line.strip_suffix(b"\n") {
                Some(body) if !body.ends_with(b"\r") => {
                    self.0.write_all(body)?;
                    self.0.write_all(b"\r\n")?;
                }
                _ => self.0.write_all(line)?,
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Wait up to `timeout` for a key press.
fn poll_key(timeout: Duration) -> io::Result<Option<KeyEvent>> {
    if !event::poll(timeout)? {
        return Ok(None);
    }
    match event::read()? {
        Event::Key(key) if key.kind == KeyEventKind::Press => Ok(Some(key)),
        _ => Ok(None),
    }
}

/// Spawn the keyboard thread, forwarding decoded commands until `shutdown` is set
/// or the receiver is gone. The terminal stays in raw mode while the thread runs.
pub fn spawn_keyboard(tx: Sender<Command>, shutdown: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("keyboard".into()).spawn(move || {
        let _raw = match RawMode::enable() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Keyboard input unavailable: {e}");
                return;
            }
        };
        while !shutdown.load(Ordering::SeqCst) {
            match poll_key(Duration::from_millis(50)) {
                Ok(Some(key)) => {
                    if let Some(command) = decode_key(key.code) {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => (),
                Err(e) => {
                    warn!("Keyboard input unavailable: {e}");
                    break;
                }
            }
        }
    })
}

/// Block until a key is pressed.
pub fn wait_for_keypress() -> io::Result<()> {
    let _raw = RawMode::enable()?;
    loop {
        if let Event::Key(key) = event::read()? {
            if key.kind == KeyEventKind::Press {
                return Ok(());
            }
        }
    }
}
