use crate::{DaqError, DecodedEvent, PlotModeConfig, PlotSettings};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, Stdio},
    thread::{self, JoinHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotMode {
    Off,
    /// Arm once per print interval.
    Periodic,
    /// Arm every cycle.
    Continuous,
}

impl From<PlotModeConfig> for PlotMode {
    fn from(mode: PlotModeConfig) -> Self {
        match mode {
            PlotModeConfig::Off => PlotMode::Off,
            PlotModeConfig::Periodic => PlotMode::Periodic,
            PlotModeConfig::Continuous => PlotMode::Continuous,
        }
    }
}

/// What the loop observed this cycle for the plotted board and channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlotInput {
    /// Acquisition is running; continuous plotting only arms while it is.
    pub acquiring: bool,
    /// A print cycle ran this cycle.
    pub interval_elapsed: bool,
    pub channel_enabled: bool,
    /// The plotted board delivered data since the previous print cycle.
    pub bytes_arrived: bool,
    /// Index of the last event in this cycle's buffer that carries the channel.
    pub matched_event: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotWarning {
    ChannelNotEnabled,
    /// The board sent data for a whole interval but never the plotted channel.
    NoMatchingEvent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlotOutcome {
    pub dispatch: Option<usize>,
    pub warning: Option<PlotWarning>,
}

/// Decides once per cycle whether an event of the plotted channel goes to the renderer.
#[derive(Debug)]
pub struct PlotDispatcher {
    mode: PlotMode,
    pending: bool,
    one_shot: bool,
    /// The disabled-channel warning was already given for the current selection.
    disabled_warned: bool,
}

impl PlotDispatcher {
    pub fn new(mode: PlotMode) -> Self {
        Self {
            mode,
            pending: false,
            one_shot: false,
            disabled_warned: false,
        }
    }

    pub fn mode(&self) -> PlotMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: PlotMode) {
        self.mode = mode;
        self.disabled_warned = false;
        if mode == PlotMode::Off {
            self.pending = false;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Plot the next matching event once, whatever the mode.
    pub fn request_one_shot(&mut self) {
        self.one_shot = true;
        self.pending = true;
    }

    /// Forget any outstanding request, e.g. when the plotted channel changes.
    pub fn clear(&mut self) {
        self.pending = false;
        self.one_shot = false;
        self.disabled_warned = false;
    }

    pub fn evaluate(&mut self, input: PlotInput) -> PlotOutcome {
        let mut outcome = PlotOutcome::default();

        if input.interval_elapsed {
            // a request armed on an earlier interval saw data but no matching event
            if self.pending && !self.one_shot && input.bytes_arrived {
                self.pending = false;
                outcome.warning = Some(PlotWarning::NoMatchingEvent);
            }
            if self.mode == PlotMode::Periodic {
                self.pending = true;
            }
        }
        if self.mode == PlotMode::Continuous && input.acquiring {
            self.pending = true;
        }
        let one_shot = std::mem::take(&mut self.one_shot);

        if !self.pending {
            return outcome;
        }
        if !input.channel_enabled {
            self.pending = false;
            // explicit requests always report, automatic re-arming reports once
            if one_shot || !self.disabled_warned {
                outcome.warning = Some(PlotWarning::ChannelNotEnabled);
            }
            self.disabled_warned = true;
        } else if let Some(index) = input.matched_event {
            self.pending = false;
            outcome.dispatch = Some(index);
        }
        outcome
    }
}

/// Message handed to the renderer: a copy of one event and what to draw.
#[derive(Debug, Clone)]
pub struct PlotEvent {
    pub board: usize,
    pub channel: usize,
    pub event: DecodedEvent,
}

impl PlotEvent {
    pub fn title(&self) -> String {
        format!(
            "Board {} Ch {} TimeStamp {}",
            self.board, self.channel, self.event.timestamp
        )
    }
}

/// Write the plotted waveform as `index sample` lines.
pub fn write_plot_data(path: &Path, plot: &PlotEvent) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for (i, sample) in plot.event.waveform(plot.channel).iter().enumerate() {
        writeln!(out, "{i} {sample}")?;
    }
    out.flush()
}

/// Renderer side of the plot channel.
///
/// Writes each received event to `data_file` and, with a gnuplot executable
/// configured, asks gnuplot to redraw it. Failures are logged and the
/// renderer keeps going.
struct Renderer {
    data_file: PathBuf,
    gnuplot: Option<String>,
    child: Option<(Child, ChildStdin)>,
}

impl Renderer {
    fn render(&mut self, plot: &PlotEvent) {
        if let Err(e) = write_plot_data(&self.data_file, plot) {
            warn!("Can't write plot data {}: {e}", self.data_file.display());
            return;
        }
        debug!("Plotted {}", plot.title());
        let Some(exe) = self.gnuplot.as_deref() else {
            return;
        };
        if self.child.is_none() {
            match spawn_gnuplot(exe) {
                Ok(child) => self.child = Some(child),
                Err(e) => {
                    warn!("Can't start {exe}: {e}");
                    self.gnuplot = None;
                    return;
                }
            }
        }
        if let Some((_, stdin)) = self.child.as_mut() {
            let script = format!(
                "set title '{}'\nplot '{}' using 1:2 with steps notitle\n",
                plot.title(),
                self.data_file.display()
            );
            if let Err(e) = stdin.write_all(script.as_bytes()).and_then(|_| stdin.flush()) {
                warn!("Plotter pipe closed: {e}");
                self.child = None;
            }
        }
    }

    fn close(&mut self) {
        if let Some((mut child, stdin)) = self.child.take() {
            drop(stdin);
            if let Err(e) = child.wait() {
                warn!("Plotter did not exit cleanly: {e}");
            }
        }
    }
}

fn spawn_gnuplot(exe: &str) -> std::io::Result<(Child, ChildStdin)> {
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdin"))?;
    Ok((child, stdin))
}

/// Start the renderer thread. Dropping the returned sender stops it.
pub fn spawn_renderer(
    settings: &PlotSettings,
) -> Result<(Sender<PlotEvent>, JoinHandle<()>), DaqError> {
    let (tx, rx) = unbounded();
    let mut renderer = Renderer {
        data_file: PathBuf::from(&settings.data_file),
        gnuplot: settings.gnuplot.clone(),
        child: None,
    };
    let handle = thread::Builder::new()
        .name("plotter".into())
        .spawn(move || render_loop(rx, &mut renderer))
        .map_err(DaqError::Plotter)?;
    Ok((tx, handle))
}

fn render_loop(rx: Receiver<PlotEvent>, renderer: &mut Renderer) {
    for plot in rx {
        renderer.render(&plot);
    }
    renderer.close();
}
