use crate::{
    AcquisitionSession, BoardInfo, Clock, Command, Conf, CounterSnapshot, DaqError,
    DecodedEvent, Digitizer, DigitizerError, IntervalTimer, OutputFileManager, PerBoardSettings,
    PlotDispatcher, PlotEvent, PlotInput, PlotMode, PlotWarning, RawWrite, SessionEnd, SessionTick,
    StatisticsAggregator, DAW_FW_ID, HELP, MAX_CHANNELS,
};
use crossbeam_channel::{tick, Receiver, Sender};
use log::{debug, error, info, warn};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// One configured board and the buffers that belong to it.
#[derive(Debug)]
pub struct Board<D> {
    pub digitizer: D,
    pub info: BoardInfo,
    pub enable_mask: u16,
    pub save_waves: bool,
    /// Events decoded from the board's latest non-empty buffer of this cycle.
    pub events: Vec<DecodedEvent>,
}

/// Mutable run state; only the readout loop changes it.
#[derive(Debug, Default)]
pub struct RunState {
    pub quit: bool,
    pub continuous_trigger: bool,
    /// A print cycle was requested for the next cycle regardless of the timer.
    pub one_shot_print: bool,
    pub plot_board: usize,
    pub plot_channel: usize,
    /// Label of the last finished session, used to rename the raw files.
    pub session_label: Option<String>,
    /// Last event of the plotted board carrying the plotted channel, this cycle.
    pub matched_event: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Quit,
    SessionExpired,
}

/// Polls every board once per cycle and keeps statistics, output files, the
/// session and the plot request up to date.
pub struct ReadoutLoop<'a, D: Digitizer, C: Clock> {
    conf: &'a Conf,
    clock: C,
    boards: Vec<Board<D>>,
    buffer: Vec<u8>,
    stats: StatisticsAggregator,
    baseline: CounterSnapshot,
    files: OutputFileManager,
    session: AcquisitionSession,
    plots: PlotDispatcher,
    print_timer: IntervalTimer,
    state: RunState,
}

fn close_boards<D: Digitizer>(boards: &mut [Board<D>]) {
    for (index, board) in boards.iter_mut().enumerate().rev() {
        if let Err(e) = board.digitizer.close() {
            warn!("Board {index}: close failed: {e}");
        }
    }
}

fn open_boards<D, F>(conf: &Conf, mut open: F) -> Result<Vec<Board<D>>, DaqError>
where
    D: Digitizer,
    F: FnMut(usize, &PerBoardSettings) -> Result<D, DigitizerError>,
{
    let settings = &conf.board_settings.boards;
    let mut boards: Vec<Board<D>> = Vec::with_capacity(settings.len());

    info!("Open digitizers");
    for (index, board_settings) in settings.iter().enumerate() {
        let opened = open(index, board_settings)
            .map_err(|source| DaqError::Open { board: index, source })
            .and_then(|digitizer| {
                let info = digitizer
                    .info()
                    .map_err(|source| DaqError::BoardInfo { board: index, source });
                match info {
                    Ok(info) => Ok((digitizer, info)),
                    Err(e) => {
                        let mut digitizer = digitizer;
                        if let Err(close) = digitizer.close() {
                            warn!("Board {index}: close failed: {close}");
                        }
                        Err(e)
                    }
                }
            });
        let (digitizer, info) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                close_boards(&mut boards);
                return Err(e);
            }
        };
        info!(
            "Board {index}: {} serial {}, ROC FPGA {}, AMC FPGA {}",
            info.model_name, info.serial_number, info.roc_firmware, info.amc_firmware
        );
        let firmware = info.firmware_code;
        boards.push(Board {
            digitizer,
            info,
            enable_mask: board_settings.enabled_channels.mask(),
            save_waves: board_settings.save_waves,
            events: Vec::new(),
        });
        if firmware != DAW_FW_ID {
            close_boards(&mut boards);
            return Err(DaqError::WrongFirmware {
                board: index,
                found: firmware,
            });
        }
    }
    Ok(boards)
}

fn program_boards<D: Digitizer>(conf: &Conf, boards: &mut [Board<D>]) -> Result<(), DaqError> {
    info!("Program digitizers");
    for (index, board) in boards.iter_mut().enumerate() {
        let settings = &conf.board_settings.boards[index];
        board
            .digitizer
            .program(settings)
            .map_err(|source| DaqError::Program { board: index, source })?;
        // boards report fewer channels than the mask can address
        if board.info.channels < MAX_CHANNELS {
            board.enable_mask &= ((1u32 << board.info.channels) - 1) as u16;
        }
    }
    Ok(())
}

/// Reserve the readout buffer and per-board event storage from the board maxima.
fn allocate_buffers<D: Digitizer>(boards: &mut [Board<D>]) -> Result<Vec<u8>, DaqError> {
    let bytes = boards
        .iter()
        .map(|board| board.digitizer.max_readout_size())
        .max()
        .unwrap_or(0);
    debug!("Readout buffer malloc ({bytes} bytes)");
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(bytes)
        .map_err(|_| DaqError::Malloc { bytes })?;

    let max_events = boards
        .iter()
        .map(|board| board.digitizer.max_events_per_read())
        .max()
        .unwrap_or(0);
    for board in boards.iter_mut() {
        board.events.try_reserve_exact(max_events).map_err(|_| DaqError::Malloc {
            bytes: max_events * std::mem::size_of::<DecodedEvent>(),
        })?;
    }
    Ok(buffer)
}

impl<'a, D: Digitizer, C: Clock> ReadoutLoop<'a, D, C> {
    /// Open, check and program every board, then prepare output files and buffers.
    pub fn setup(conf: &'a Conf, clock: C) -> Result<Self, DaqError> {
        Self::setup_with(conf, clock, D::open)
    }

    /// Like [`ReadoutLoop::setup`], opening boards with `open`.
    ///
    /// On failure everything acquired so far is released before returning.
    pub fn setup_with<F>(conf: &'a Conf, clock: C, open: F) -> Result<Self, DaqError>
    where
        F: FnMut(usize, &PerBoardSettings) -> Result<D, DigitizerError>,
    {
        let mut boards = open_boards(conf, open)?;
        match Self::prepare(conf, &mut boards) {
            Ok((files, buffer)) => {
                let now = clock.now_ms();
                let stats = StatisticsAggregator::new(boards.len());
                let baseline = stats.snapshot(now);
                Ok(Self {
                    conf,
                    clock,
                    boards,
                    buffer,
                    stats,
                    baseline,
                    files,
                    session: AcquisitionSession::new(),
                    plots: PlotDispatcher::new(conf.plot_settings.mode.into()),
                    print_timer: IntervalTimer::new(conf.run_settings.print_interval_ms, now),
                    state: RunState {
                        continuous_trigger: conf.run_settings.continuous_trigger,
                        plot_board: conf.plot_settings.board,
                        plot_channel: conf.plot_settings.channel,
                        ..Default::default()
                    },
                })
            }
            Err(e) => {
                close_boards(&mut boards);
                Err(e)
            }
        }
    }

    fn prepare(
        conf: &Conf,
        boards: &mut [Board<D>],
    ) -> Result<(OutputFileManager, Vec<u8>), DaqError> {
        program_boards(conf, boards)?;

        let run = &conf.run_settings;
        let dir = Path::new(&run.output_dir);
        crate::create_output_dir(dir)?;
        let mut files =
            OutputFileManager::new(dir, &run.output_file_name, boards.len(), run.max_file_size_mb);
        if run.raw_enable {
            for board in 0..boards.len() {
                files.open(board, 0)?;
            }
        }

        let buffer = allocate_buffers(boards)?;
        Ok((files, buffer))
    }

    pub fn boards(&self) -> &[Board<D>] {
        &self.boards
    }

    pub fn stats(&self) -> &StatisticsAggregator {
        &self.stats
    }

    pub fn files(&self) -> &OutputFileManager {
        &self.files
    }

    pub fn session(&self) -> &AcquisitionSession {
        &self.session
    }

    pub fn plots(&self) -> &PlotDispatcher {
        &self.plots
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Run until quit, session expiry or a fatal readout error.
    pub fn run(
        &mut self,
        commands: &Receiver<Command>,
        plot_tx: &Sender<PlotEvent>,
    ) -> Result<RunExit, DaqError> {
        let poll_interval = self.conf.run_settings.poll_interval_ms;
        let ticker = (poll_interval > 0).then(|| tick(Duration::from_millis(poll_interval)));
        let mut exit = RunExit::Quit;

        info!("[s] start/stop the acquisition, [q] quit, [space key] help");
        while !self.state.quit {
            if let Some(ticker) = &ticker {
                let _ = ticker.recv();
            }
            let now = self.clock.now_ms();

            while let Ok(command) = commands.try_recv() {
                self.apply(command, now);
            }
            if self.state.quit {
                break;
            }

            if let SessionTick::Expired(end) =
                self.session.tick(now, self.conf.run_settings.acq_time_s)
            {
                info!(
                    "Acquisition time ({} seconds) reached. Stopping...",
                    self.conf.run_settings.acq_time_s
                );
                self.stop_acquisition(end);
                self.state.quit = true;
                exit = RunExit::SessionExpired;
            }

            if self.state.continuous_trigger && self.session.is_running() {
                self.send_sw_triggers();
            }

            self.read_boards()?;
            let print = self.print_cycle(now);
            self.dispatch_plot(print, plot_tx);
        }
        Ok(exit)
    }

    fn apply(&mut self, command: Command, now: i64) {
        match command {
            Command::Quit => self.state.quit = true,
            Command::ToggleAcquisition => match self.session.stop(now) {
                Some(end) => self.stop_acquisition(end),
                None => self.start_acquisition(now),
            },
            Command::SoftwareTrigger => self.send_sw_triggers(),
            Command::ToggleContinuousTrigger => {
                self.state.continuous_trigger = !self.state.continuous_trigger;
                info!(
                    "Continuous software trigger {}",
                    if self.state.continuous_trigger { "enabled" } else { "disabled" }
                );
            }
            Command::OneShotPlot => {
                if self.session.is_running() {
                    self.plots.request_one_shot();
                    self.state.one_shot_print = true;
                } else {
                    warn!("Acquisition is not running, nothing to plot");
                }
            }
            Command::TogglePeriodicPlot => {
                let mode = match self.plots.mode() {
                    PlotMode::Off => PlotMode::Periodic,
                    PlotMode::Periodic | PlotMode::Continuous => PlotMode::Off,
                };
                self.plots.set_mode(mode);
                info!("Plot mode {mode:?}");
            }
            Command::NextBoard => {
                self.state.plot_board = (self.state.plot_board + 1) % self.boards.len();
                self.plots.clear();
                info!("Plotting board {}", self.state.plot_board);
            }
            Command::NextChannel => {
                self.state.plot_channel = (self.state.plot_channel + 1) % MAX_CHANNELS;
                self.plots.clear();
                info!("Plotting channel {}", self.state.plot_channel);
            }
            Command::Help => info!("\n{HELP}"),
        }
    }

    fn start_acquisition(&mut self, now: i64) {
        for (index, board) in self.boards.iter_mut().enumerate() {
            if let Err(e) = board.digitizer.start() {
                error!("Board {index}: can't start acquisition: {e}");
            }
        }
        self.session.start(now);
        self.stats.reset();
        self.baseline = self.stats.snapshot(now);
        self.print_timer.restart(now);
        match self.conf.run_settings.acq_time_s {
            0 => info!("Acquisition started"),
            limit => info!("Acquisition started. Will run for {limit} seconds."),
        }
    }

    fn stop_acquisition(&mut self, end: SessionEnd) {
        for (index, board) in self.boards.iter_mut().enumerate() {
            if let Err(e) = board.digitizer.stop() {
                error!("Board {index}: can't stop acquisition: {e}");
            }
        }
        let label = end.label();
        info!("Acquisition stopped, duration {}s ({label})", end.elapsed_s);
        self.state.session_label = Some(label);
    }

    fn send_sw_triggers(&mut self) {
        for (index, board) in self.boards.iter_mut().enumerate() {
            if let Err(e) = board.digitizer.send_sw_trigger() {
                warn!("Board {index}: software trigger failed: {e}");
            }
        }
    }

    /// Poll every board in index order. The first readout or decode failure ends the scan.
    fn read_boards(&mut self) -> Result<(), DaqError> {
        let (plot_board, plot_channel) = (self.state.plot_board, self.state.plot_channel);
        self.state.matched_event = None;

        for (index, board) in self.boards.iter_mut().enumerate() {
            board
                .digitizer
                .poll(&mut self.buffer)
                .map_err(|source| DaqError::Readout { board: index, source })?;
            if self.buffer.is_empty() {
                board.events.clear();
                continue;
            }

            self.stats.record_buffer(index, self.buffer.len() as u64);
            board
                .digitizer
                .decode_events(&self.buffer, &mut board.events)
                .map_err(|source| DaqError::EventDecode { board: index, source })?;
            for (i, event) in board.events.iter().enumerate() {
                self.stats
                    .record_event(index, event.channel_mask, event.truncated_mask, event.timestamp);
                if index == plot_board && event.has_channel(plot_channel) {
                    self.state.matched_event = Some(i);
                }
            }

            match self.files.write(index, &self.buffer) {
                Ok(RawWrite::Rotated { index: rotation }) => {
                    info!("Board {index}: raw output continues in file #{rotation}")
                }
                Ok(_) => (),
                Err(e) => error!("Board {index}: {e}; raw capture stopped for this board"),
            }
        }
        Ok(())
    }

    /// Print statistics when the interval elapsed or a print was requested.
    ///
    /// Returns whether the plotted board sent data since the previous print, or
    /// `None` if no print happened.
    fn print_cycle(&mut self, now: i64) -> Option<bool> {
        if !self.session.is_running() {
            return None;
        }
        let due = self.print_timer.fire(now);
        let forced = std::mem::take(&mut self.state.one_shot_print);
        if !(due || forced) {
            return None;
        }

        let plot_board = self.state.plot_board;
        let bytes_arrived = self.stats.source(plot_board).byte_count
            != self.baseline.source(plot_board).byte_count;

        info!("==========================================");
        for (index, board) in self.boards.iter().enumerate() {
            let report = self.stats.report(index, &self.baseline, now, board.enable_mask);
            let marker = if index == plot_board { " (plotted)" } else { "" };
            info!("{report}{marker}");
            if board.save_waves {
                if let Err(e) = self.files.write_waves(index, &board.events) {
                    error!("Board {index}: {e}");
                }
            }
        }
        self.baseline = self.stats.snapshot(now);
        Some(bytes_arrived)
    }

    fn dispatch_plot(&mut self, print: Option<bool>, plot_tx: &Sender<PlotEvent>) {
        let (board, channel) = (self.state.plot_board, self.state.plot_channel);
        let outcome = self.plots.evaluate(PlotInput {
            acquiring: self.session.is_running(),
            interval_elapsed: print.is_some(),
            channel_enabled: self.boards[board].enable_mask & (1 << channel) != 0,
            bytes_arrived: print.unwrap_or(false),
            matched_event: self.state.matched_event,
        });

        match outcome.warning {
            Some(PlotWarning::ChannelNotEnabled) => warn!(
                "The channel selected for plotting (board #{board}, channel #{channel}) is not enabled"
            ),
            Some(PlotWarning::NoMatchingEvent) => warn!(
                "The channel selected for plotting (board #{board}, channel #{channel}) was not present in data"
            ),
            None => (),
        }

        let Some(index) = outcome.dispatch else {
            return;
        };
        let Some(event) = self.boards[board].events.get(index) else {
            return;
        };
        let plot = PlotEvent {
            board,
            channel,
            event: event.clone(),
        };
        if plot_tx.send(plot).is_err() {
            warn!("Plotter is not running, event dropped");
        }
    }

    /// Stop the boards, finalize output files, free buffers and close the boards.
    ///
    /// Returns the final paths of the raw files that were open.
    pub fn shutdown(mut self) -> Vec<PathBuf> {
        let now = self.clock.now_ms();
        match self.session.stop(now) {
            Some(end) => self.stop_acquisition(end),
            None => {
                for (index, board) in self.boards.iter_mut().enumerate() {
                    if let Err(e) = board.digitizer.stop() {
                        warn!("Board {index}: stop failed: {e}");
                    }
                }
            }
        }

        let label = self.state.session_label.as_deref();
        let mut finalized = Vec::new();
        for index in 0..self.boards.len() {
            match self.files.close_and_finalize(index, label) {
                Some(Ok(path)) => {
                    info!("Board {index}: FilePath: {}", path.display());
                    finalized.push(path);
                }
                Some(Err(e)) => warn!("Board {index}: {e}"),
                None => (),
            }
        }
        self.files.close_waves();

        self.buffer = Vec::new();
        for board in self.boards.iter_mut() {
            board.events = Vec::new();
        }
        close_boards(&mut self.boards);
        finalized
    }
}
