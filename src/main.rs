#[macro_use]
extern crate log;

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{CombinedLogger, Config, LevelFilter, SharedLogger, SimpleLogger, WriteLogger};

use fr32_uart_loader::bootstrap::State;
use fr32_uart_loader::native::Serial;
use fr32_uart_loader::profile::{parse_mhz, ChipTable};
use fr32_uart_loader::protocol::BLOCK_SIZE;
use fr32_uart_loader::srec::{self, IMAGE_SIZE};
use fr32_uart_loader::trace::HexTrace;
use fr32_uart_loader::{Bootstrap, Error, Loader, Options, StdDelay, Transport};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Chip definition file
    #[structopt(long, default_value = "chipdef32.ini")]
    chipdefs: PathBuf,

    /// MCU to program, see --list
    #[structopt(long)]
    mcu: Option<String>,

    /// Crystal frequency in MHz
    #[structopt(long, default_value = "4")]
    clock: String,

    /// Seconds to wait for the MCU to power up (1-60)
    #[structopt(long, default_value = "5")]
    timeout: u32,

    /// Directory holding the flash loader executables
    #[structopt(long, default_value = "kernal32")]
    kernel_dir: PathBuf,

    /// Dump serial traffic at debug level
    #[structopt(long)]
    dump: bool,

    /// List supported MCUs and exit
    #[structopt(long)]
    list: bool,

    /// Only blank check the flash
    #[structopt(long)]
    blank_check: bool,

    /// Read the flash into an S-Record file
    #[structopt(long)]
    read: Option<PathBuf>,

    /// Erase the flash
    #[structopt(long)]
    erase: bool,

    /// Program the flash from an S-Record file
    #[structopt(long)]
    write: Option<PathBuf>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console and log file output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    /// File the log is also written to
    #[structopt(long, default_value = "main.log")]
    log_file: PathBuf,
}

/// Process exit codes
#[derive(Copy, Clone, Debug, PartialEq)]
enum Exit {
    Timeout = 1,
    NotBlank = 2,
    IsBlank = 3,
    Read = 4,
    Write = 5,
    Srecord = 6,
    Crc = 7,
    Serial = 8,
    Chipdef = 9,
    Argument = 10,
    InitBootstrap = 11,
    InitLoader = 12,
    Blank = 13,
    Erase = 14,
}

struct Failure {
    exit: Exit,
    error: Option<anyhow::Error>,
}

impl Failure {
    /// Exit reporting the chip state rather than an error
    fn status(exit: Exit) -> Self {
        Self { exit, error: None }
    }
}

trait OrExit<T> {
    fn or_exit(self, exit: Exit) -> Result<T, Failure>;
}

impl<T, E> OrExit<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn or_exit(self, exit: Exit) -> Result<T, Failure> {
        self.map_err(|e| Failure {
            exit,
            error: Some(e.into()),
        })
    }
}

/// Map a driver error, transport and integrity failures take precedence
/// over the step that failed
fn driver<T>(r: Result<T, Error<io::Error>>, exit: Exit) -> Result<T, Failure> {
    r.map_err(|e| {
        let exit = match &e {
            Error::Transport(_) => Exit::Serial,
            Error::ChecksumMismatch { .. } | Error::CrcRejected => Exit::Crc,
            _ => exit,
        };
        Failure {
            exit,
            error: Some(e.into()),
        }
    })
}

/// Raise the line rate once stage 2 is running
fn switch_baud<P>(port: &mut P, baud: u32) -> Result<(), Failure>
where
    P: Transport<io::Error>,
{
    debug!("Switching to {} baud", baud);
    driver(port.set_baud(baud).map_err(Error::Transport), Exit::Serial)
}

/// Console logger, plus a file logger when `path` can be created
fn loggers(level: LevelFilter, path: &Path) -> (Vec<Box<dyn SharedLogger>>, Option<io::Error>) {
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![SimpleLogger::new(level, Config::default())];
    match File::create(path) {
        Ok(f) => {
            loggers.push(WriteLogger::new(level, Config::default(), f));
            (loggers, None)
        }
        Err(e) => (loggers, Some(e)),
    }
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger, console plus log file
    let (sinks, log_err) = loggers(o.log_level, &o.log_file);
    if let Some(e) = log_err {
        eprintln!("Could not open log file '{}': {}", o.log_file.display(), e);
    }
    let _ = CombinedLogger::init(sinks);

    if let Err(f) = run(&o) {
        if let Some(e) = f.error {
            error!("{:#}", e);
        }
        std::process::exit(f.exit as i32);
    }
}

fn run(o: &Args) -> Result<(), Failure> {
    let chips = ChipTable::load(&o.chipdefs)
        .with_context(|| format!("loading {}", o.chipdefs.display()))
        .or_exit(Exit::Chipdef)?;

    if o.list {
        for d in chips.devices() {
            let clocks: Vec<String> = d
                .clocks
                .iter()
                .map(|c| format!("{}", c.crystal_hz as f32 / 1e6))
                .collect();
            println!("{:<20} {} MHz", d.name, clocks.join(", "));
        }
        return Ok(());
    }

    let mcu = o
        .mcu
        .as_ref()
        .ok_or_else(|| anyhow!("missing --mcu, see --list"))
        .or_exit(Exit::Argument)?;
    let profile = chips.get(mcu).or_exit(Exit::Argument)?;

    let crystal = parse_mhz(&o.clock)
        .ok_or_else(|| anyhow!("invalid clock '{}'", o.clock))
        .or_exit(Exit::Argument)?;
    let rates = profile.rates(crystal).or_exit(Exit::Argument)?;

    let kernel_path = o.kernel_dir.join(&profile.kernel);
    let kernel = std::fs::read(&kernel_path)
        .with_context(|| format!("loading flash loader {}", kernel_path.display()))
        .or_exit(Exit::InitBootstrap)?;

    debug!(
        "Loaded '{}' ({} bytes)",
        kernel_path.display(),
        kernel.len()
    );

    let read_timeout = Duration::from_millis(o.options.read_timeout_ms as u64);
    let serial = Serial::open(&o.port, rates.stage1_baud, read_timeout)
        .with_context(|| format!("opening {}", o.port))
        .or_exit(Exit::Serial)?;
    let port = HexTrace::new(serial, &o.port, o.dump);

    // Stage 1
    let mut boot = driver(
        Bootstrap::new(port, StdDelay, profile, kernel, o.options.clone()),
        Exit::InitBootstrap,
    )?;

    info!("Waiting for MCU, apply power to the board");

    if let Err(e) = boot.handoff(o.timeout) {
        let exit = match boot.state() {
            State::Checked => Exit::Write,
            _ => Exit::Timeout,
        };
        return driver(Err(e), exit);
    }

    let (mut port, delay) = boot.into_inner();

    switch_baud(&mut port, rates.stage2())?;

    // Stage 2
    let mut loader = Loader::new(port, delay, profile, o.options.clone());

    driver(loader.intro(), Exit::InitLoader)?;

    let is_blank = driver(loader.blank_check(profile.flash_start), Exit::Blank)?.is_blank();

    let (read, write) = (o.read.is_some(), o.write.is_some());
    if o.blank_check
        || (is_blank && (!write || read))
        || (!is_blank && !write && !read && !o.erase)
    {
        info!("Chip is {}", if is_blank { "blank" } else { "not blank" });
        return Err(Failure::status(if is_blank {
            Exit::IsBlank
        } else {
            Exit::NotBlank
        }));
    }

    if let Some(path) = &o.read {
        let range = profile.flash_range();
        let end = range.end.min(IMAGE_SIZE as u32);

        let pb = ProgressBar::new((end - range.start) as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} {msg}")
                .progress_chars("#>-"),
        );

        let image = driver(
            loader.read_flash(|address, crc| {
                pb.set_message(&format!("0x{:06X} crc 0x{:04X}", address, crc));
                pb.inc(BLOCK_SIZE as u64);
            }),
            Exit::Read,
        )?;
        pb.finish_and_clear();

        let f = File::create(path)
            .with_context(|| format!("creating {}", path.display()))
            .or_exit(Exit::Srecord)?;
        srec::write_records(BufWriter::new(f), image.slice(range.start..end), 2, range.start)
            .with_context(|| format!("writing {}", path.display()))
            .or_exit(Exit::Srecord)?;

        info!(
            "Read {} into '{}'",
            bytefmt::format((end - range.start) as u64),
            path.display()
        );
    }

    if !is_blank && write && !o.erase {
        error!("Chip is not blank, add --erase to write it");
        return Err(Failure::status(Exit::NotBlank));
    }

    if o.erase && !is_blank {
        let pb = ProgressBar::new_spinner();
        pb.set_message("Erasing");
        pb.enable_steady_tick(100);

        driver(loader.erase_chip(profile.flash_start), Exit::Erase)?;
        pb.finish_and_clear();

        info!("Chip erased");
    }

    if let Some(path) = &o.write {
        let f = File::open(path)
            .with_context(|| format!("opening {}", path.display()))
            .or_exit(Exit::Srecord)?;
        let image = srec::linearize(BufReader::new(f), profile.flash_start, profile.flash_end)
            .with_context(|| format!("loading {}", path.display()))
            .or_exit(Exit::Srecord)?;

        let end = profile.flash_end.min(IMAGE_SIZE as u32 - 1);
        let blocks: Vec<u32> = (profile.flash_start..=end).step_by(BLOCK_SIZE).collect();
        let used = blocks
            .iter()
            .filter(|&&a| !image.is_blank(a..a.saturating_add(BLOCK_SIZE as u32).min(end + 1)))
            .count();

        info!(
            "Writing {} from '{}'",
            bytefmt::format((used * BLOCK_SIZE) as u64),
            path.display()
        );

        let pb = ProgressBar::new(blocks.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40}] {pos}/{len} blocks {msg}")
                .progress_chars("#>-"),
        );

        driver(
            loader.program(&image, |address, _| {
                pb.set_message(&format!("0x{:06X}", address));
                pb.inc(1);
            }),
            Exit::Write,
        )?;
        pb.finish_and_clear();

        info!("Chip programmed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Port {
        baud: Option<u32>,
        fail: bool,
    }

    impl Transport<io::Error> for Port {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize, io::Error> {
            Ok(0)
        }
        fn write(&mut self, data: &[u8]) -> Result<usize, io::Error> {
            Ok(data.len())
        }
        fn purge(&mut self) -> Result<(), io::Error> {
            Ok(())
        }
        fn drain(&mut self) -> Result<(), io::Error> {
            Ok(())
        }
        fn set_baud(&mut self, baud: u32) -> Result<(), io::Error> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "unsupported rate"));
            }
            self.baud = Some(baud);
            Ok(())
        }
    }

    #[test]
    fn baud_switch_applies_stage_two_rate() {
        let mut port = Port {
            baud: None,
            fail: false,
        };
        assert!(switch_baud(&mut port, 115_200).is_ok());
        assert_eq!(port.baud, Some(115_200));
    }

    #[test]
    fn baud_switch_failure_is_a_serial_error() {
        let mut port = Port {
            baud: None,
            fail: true,
        };
        match switch_baud(&mut port, 115_200) {
            Err(f) => {
                assert_eq!(f.exit, Exit::Serial);
                assert!(f.error.is_some());
            }
            Ok(()) => panic!("baud switch should fail"),
        }
    }

    #[test]
    fn log_file_is_created_beside_console() {
        let path = std::env::temp_dir().join(format!("fr32-log-{}.log", std::process::id()));
        let (l, err) = loggers(LevelFilter::Info, &path);
        assert_eq!(l.len(), 2);
        assert!(err.is_none());
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unwritable_log_file_keeps_console() {
        let path = std::env::temp_dir().join("fr32-missing-dir").join("nested").join("main.log");
        let (l, err) = loggers(LevelFilter::Info, &path);
        assert_eq!(l.len(), 1);
        assert!(err.is_some());
    }

    #[test]
    fn integrity_errors_take_precedence() {
        let r: Result<(), _> = driver(Err(Error::CrcRejected), Exit::Write);
        assert!(matches!(r, Err(Failure { exit: Exit::Crc, .. })));

        let r: Result<(), _> = driver(Err(Error::Timeout), Exit::Write);
        assert!(matches!(r, Err(Failure { exit: Exit::Write, .. })));
    }
}
