use crossbeam_channel::unbounded;
use daw_runner::*;
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

const KIB: usize = 1024;

/// Clock that moves forward by `step` ms every time it is read.
struct SteppingClock {
    now: Cell<i64>,
    step: i64,
}

impl SteppingClock {
    fn new(start: i64, step: i64) -> Self {
        Self {
            now: Cell::new(start),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now_ms(&self) -> i64 {
        let now = self.now.get();
        self.now.set(now + self.step);
        now
    }
}

#[derive(Debug, Default)]
struct Script {
    buffers: VecDeque<Result<Vec<u8>, DigitizerError>>,
    polls: usize,
    running: bool,
    closed: bool,
    decode_error: bool,
    info_error: bool,
    stop_error: bool,
    firmware_code: u32,
}

/// Digitizer replaying prepared buffers; every buffer decodes into two events.
#[derive(Clone)]
struct Scripted {
    script: Rc<RefCell<Script>>,
    channel_mask: u16,
}

impl Scripted {
    fn new(buffers: Vec<Result<Vec<u8>, DigitizerError>>, channel_mask: u16) -> Self {
        Self {
            script: Rc::new(RefCell::new(Script {
                buffers: buffers.into(),
                firmware_code: DAW_FW_ID,
                ..Default::default()
            })),
            channel_mask,
        }
    }

    fn polls(&self) -> usize {
        self.script.borrow().polls
    }

    fn closed(&self) -> bool {
        self.script.borrow().closed
    }
}

impl Digitizer for Scripted {
    fn open(_: usize, _: &PerBoardSettings) -> Result<Self, DigitizerError> {
        Err(DigitizerError::DevNotFound)
    }

    fn info(&self) -> Result<BoardInfo, DigitizerError> {
        if self.script.borrow().info_error {
            return Err(DigitizerError::Comm);
        }
        Ok(BoardInfo {
            model_name: "scripted".into(),
            serial_number: 1,
            channels: MAX_CHANNELS,
            roc_firmware: "0".into(),
            amc_firmware: "0".into(),
            firmware_code: self.script.borrow().firmware_code,
        })
    }

    fn program(&mut self, _: &PerBoardSettings) -> Result<(), DigitizerError> {
        Ok(())
    }

    fn max_readout_size(&self) -> usize {
        1024 * KIB
    }

    fn max_events_per_read(&self) -> usize {
        16
    }

    fn start(&mut self) -> Result<(), DigitizerError> {
        self.script.borrow_mut().running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DigitizerError> {
        let mut script = self.script.borrow_mut();
        script.running = false;
        if script.stop_error {
            return Err(DigitizerError::Comm);
        }
        Ok(())
    }

    fn send_sw_trigger(&mut self) -> Result<(), DigitizerError> {
        Ok(())
    }

    fn poll(&mut self, buffer: &mut Vec<u8>) -> Result<(), DigitizerError> {
        let mut script = self.script.borrow_mut();
        script.polls += 1;
        buffer.clear();
        if !script.running {
            return Ok(());
        }
        match script.buffers.pop_front() {
            Some(Ok(data)) => {
                buffer.extend_from_slice(&data);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    fn decode_events(
        &mut self,
        buffer: &[u8],
        events: &mut Vec<DecodedEvent>,
    ) -> Result<(), DigitizerError> {
        if self.script.borrow().decode_error {
            return Err(DigitizerError::EventNotFound);
        }
        events.clear();
        for i in 0..2 {
            let mut event = DecodedEvent::new(4);
            event.timestamp = buffer.len() as u64 + i;
            event.channel_mask = self.channel_mask;
            for ch in event.channels().collect::<Vec<_>>() {
                event.n_samples[ch] = 4;
            }
            events.push(event);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DigitizerError> {
        let mut script = self.script.borrow_mut();
        script.running = false;
        script.closed = true;
        Ok(())
    }
}

fn conf(dir: &Path, n_boards: usize, acq_time_s: u32) -> Conf {
    Conf {
        run_settings: RunSettings {
            output_dir: dir.display().to_string(),
            output_file_name: "run".into(),
            raw_enable: true,
            max_file_size_mb: 1,
            acq_time_s,
            print_interval_ms: 1000,
            poll_interval_ms: 0,
            continuous_trigger: false,
        },
        plot_settings: PlotSettings {
            mode: PlotModeConfig::Periodic,
            board: 0,
            channel: 0,
            data_file: dir.join("plot.txt").display().to_string(),
            gnuplot: None,
        },
        board_settings: BoardSettings {
            boards: (0..n_boards)
                .map(|i| PerBoardSettings {
                    link: format!("script://{i}"),
                    enabled_channels: ChannelConfig::All(true),
                    record_len: 4,
                    pre_trig_len: 1,
                    save_waves: false,
                    event_rate: 0.0,
                    truncate_probability: 0.0,
                })
                .collect(),
        },
    }
}

fn buffers(n: usize, size: usize) -> Vec<Result<Vec<u8>, DigitizerError>> {
    (0..n).map(|i| Ok(vec![i as u8; size])).collect()
}

fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(prefix) && name.ends_with(".bin"))
        })
        .collect();
    files.sort();
    files
}

fn setup<'a>(
    conf: &'a Conf,
    boards: &[Scripted],
) -> Result<ReadoutLoop<'a, Scripted, SteppingClock>, DaqError> {
    ReadoutLoop::setup_with(conf, SteppingClock::new(1_000_000, 250), |index, _| {
        Ok(boards[index].clone())
    })
}

#[test]
fn rotation_is_per_board_over_a_timed_session() {
    let dir = tempfile::tempdir().unwrap();
    let conf = conf(dir.path(), 2, 3);
    // 5 x 220 KiB is the first write past 1 MiB on board 0
    let boards = [
        Scripted::new(buffers(6, 220 * KIB), 0b1),
        Scripted::new(buffers(6, 100 * KIB), 0b1),
    ];
    let mut readout = setup(&conf, &boards).unwrap();

    let (command_tx, command_rx) = unbounded();
    let (plot_tx, plot_rx) = unbounded();
    command_tx.send(Command::ToggleAcquisition).unwrap();

    let exit = readout.run(&command_rx, &plot_tx).unwrap();
    assert_eq!(exit, RunExit::SessionExpired);
    assert!(!readout.session().is_running());
    assert_eq!(readout.stats().source(0).byte_count, 6 * 220 * KIB as u64);
    assert_eq!(readout.stats().source(1).byte_count, 6 * 100 * KIB as u64);
    assert_eq!(readout.stats().source(0).channels[0].trigger_count, 12);
    assert_eq!(readout.files().rotation_index(0), Some(1));
    assert_eq!(readout.files().rotation_index(1), Some(0));

    let finalized = readout.shutdown();
    assert_eq!(finalized.len(), 2);
    for path in &finalized {
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("_3s.bin"), "{name}");
    }

    let board0 = files_with_prefix(dir.path(), "run_0_");
    let board1 = files_with_prefix(dir.path(), "run_1_");
    assert_eq!(board0.len(), 2);
    assert_eq!(board1.len(), 1);
    assert_eq!(
        fs::metadata(dir.path().join("run_0_0.bin")).unwrap().len(),
        5 * 220 * KIB as u64
    );
    assert_eq!(fs::metadata(&finalized[0]).unwrap().len(), 220 * KIB as u64);

    let plot = plot_rx.try_recv().unwrap();
    assert_eq!((plot.board, plot.channel), (0, 0));
    assert!(boards.iter().all(Scripted::closed));
}

#[test]
fn readout_error_stops_the_scan_and_finalizes_files() {
    let dir = tempfile::tempdir().unwrap();
    let conf = conf(dir.path(), 2, 0);
    let boards = [
        Scripted::new(vec![Ok(vec![1; 64]), Err(DigitizerError::Comm)], 0b1),
        Scripted::new(buffers(4, 64), 0b1),
    ];
    let mut readout = setup(&conf, &boards).unwrap();

    let (command_tx, command_rx) = unbounded();
    let (plot_tx, _plot_rx) = unbounded();
    command_tx.send(Command::ToggleAcquisition).unwrap();

    let err = readout.run(&command_rx, &plot_tx).unwrap_err();
    assert!(matches!(
        err,
        DaqError::Readout {
            board: 0,
            source: DigitizerError::Comm
        }
    ));
    assert_eq!(boards[0].polls(), 2);
    // board 1 was not polled after board 0 failed
    assert_eq!(boards[1].polls(), 1);

    let finalized = readout.shutdown();
    assert_eq!(finalized.len(), 2);
    for path in &finalized {
        assert!(path.exists());
        assert!(path.to_str().unwrap().ends_with("_0s.bin"));
    }
    assert!(boards.iter().all(Scripted::closed));
}

#[test]
fn decode_error_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let conf = conf(dir.path(), 2, 0);
    let boards = [
        Scripted::new(buffers(2, 64), 0b1),
        Scripted::new(buffers(2, 64), 0b1),
    ];
    boards[1].script.borrow_mut().decode_error = true;
    let mut readout = setup(&conf, &boards).unwrap();

    let (command_tx, command_rx) = unbounded();
    let (plot_tx, _plot_rx) = unbounded();
    command_tx.send(Command::ToggleAcquisition).unwrap();

    let err = readout.run(&command_rx, &plot_tx).unwrap_err();
    assert!(matches!(err, DaqError::EventDecode { board: 1, .. }));
    assert_eq!(boards[0].polls(), 1);
    readout.shutdown();
}

#[test]
fn quit_is_seen_before_any_poll() {
    let dir = tempfile::tempdir().unwrap();
    let conf = conf(dir.path(), 1, 0);
    let boards = [Scripted::new(buffers(2, 64), 0b1)];
    let mut readout = setup(&conf, &boards).unwrap();

    let (command_tx, command_rx) = unbounded();
    let (plot_tx, _plot_rx) = unbounded();
    command_tx.send(Command::Quit).unwrap();

    assert_eq!(readout.run(&command_rx, &plot_tx).unwrap(), RunExit::Quit);
    assert_eq!(boards[0].polls(), 0);

    // no session ran, so the raw file keeps its name
    let finalized = readout.shutdown();
    assert_eq!(finalized, vec![dir.path().join("run_0_0.bin")]);
}

#[test]
fn one_shot_on_disabled_channel_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let mut conf = conf(dir.path(), 1, 1);
    conf.plot_settings.mode = PlotModeConfig::Off;
    conf.plot_settings.channel = 3;
    conf.board_settings.boards[0].enabled_channels = ChannelConfig::List(vec![0]);
    let boards = [Scripted::new(buffers(8, 64), 0b1)];
    let mut readout = setup(&conf, &boards).unwrap();

    let (command_tx, command_rx) = unbounded();
    let (plot_tx, plot_rx) = unbounded();
    command_tx.send(Command::ToggleAcquisition).unwrap();
    command_tx.send(Command::OneShotPlot).unwrap();

    assert_eq!(
        readout.run(&command_rx, &plot_tx).unwrap(),
        RunExit::SessionExpired
    );
    assert!(!readout.plots().is_pending());
    assert!(plot_rx.try_recv().is_err());
    readout.shutdown();
}

#[test]
fn setup_failure_closes_opened_boards() {
    let dir = tempfile::tempdir().unwrap();
    let conf = conf(dir.path(), 3, 0);
    let first = Scripted::new(Vec::new(), 0);
    let opened = first.clone();

    let result = ReadoutLoop::setup_with(&conf, SteppingClock::new(0, 1), |index, _| match index {
        0 => Ok(opened.clone()),
        _ => Err(DigitizerError::DevNotFound),
    });
    assert!(matches!(
        result,
        Err(DaqError::Open {
            board: 1,
            source: DigitizerError::DevNotFound
        })
    ));
    assert!(first.closed());
}

#[test]
fn wrong_firmware_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let conf = conf(dir.path(), 1, 0);
    let board = Scripted::new(Vec::new(), 0);
    board.script.borrow_mut().firmware_code = 0x8b;

    let result = setup(&conf, std::slice::from_ref(&board));
    assert!(matches!(
        result,
        Err(DaqError::WrongFirmware {
            board: 0,
            found: 0x8b
        })
    ));
    assert!(board.closed());
}

#[test]
fn failed_rotation_keeps_the_run_going() {
    let dir = tempfile::tempdir().unwrap();
    let conf = conf(dir.path(), 2, 3);
    // board 0 can't create its second raw file
    fs::create_dir(dir.path().join("run_0_1.bin")).unwrap();
    let boards = [
        Scripted::new(buffers(6, 220 * KIB), 0b1),
        Scripted::new(buffers(6, 100 * KIB), 0b1),
    ];
    let mut readout = setup(&conf, &boards).unwrap();

    let (command_tx, command_rx) = unbounded();
    let (plot_tx, _plot_rx) = unbounded();
    command_tx.send(Command::ToggleAcquisition).unwrap();

    assert_eq!(
        readout.run(&command_rx, &plot_tx).unwrap(),
        RunExit::SessionExpired
    );
    assert!(!readout.files().is_open(0));
    assert_eq!(readout.files().current_size(1), Some(6 * 100 * KIB as u64));
    assert_eq!(boards[0].polls(), boards[1].polls());
    assert_eq!(readout.stats().source(0).byte_count, 6 * 220 * KIB as u64);

    let finalized = readout.shutdown();
    assert_eq!(finalized.len(), 1);
    let name = finalized[0].file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("run_1_0_"), "{name}");
    assert_eq!(
        fs::metadata(dir.path().join("run_0_0.bin")).unwrap().len(),
        5 * 220 * KIB as u64
    );
}

#[test]
fn shutdown_continues_past_stop_failures() {
    let dir = tempfile::tempdir().unwrap();
    let conf = conf(dir.path(), 2, 0);
    let boards = [
        Scripted::new(buffers(1, 64), 0b1),
        Scripted::new(buffers(1, 64), 0b1),
    ];
    boards[0].script.borrow_mut().stop_error = true;
    let readout = setup(&conf, &boards).unwrap();

    let finalized = readout.shutdown();
    assert_eq!(finalized.len(), 2);
    assert!(boards.iter().all(Scripted::closed));
}

#[test]
fn board_info_failure_closes_the_board() {
    let dir = tempfile::tempdir().unwrap();
    let conf = conf(dir.path(), 2, 0);
    let boards = [Scripted::new(Vec::new(), 0), Scripted::new(Vec::new(), 0)];
    boards[1].script.borrow_mut().info_error = true;

    let result = setup(&conf, &boards);
    assert!(matches!(
        result,
        Err(DaqError::BoardInfo {
            board: 1,
            source: DigitizerError::Comm
        })
    ));
    assert!(boards.iter().all(Scripted::closed));
}
