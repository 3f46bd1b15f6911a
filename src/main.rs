mod capture;
mod click;
mod config;
mod detect;
mod filter;
mod helper;
mod ocr;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};

use crate::click::{ClickController, EnigoPointer, ExternalClickHelper, Pointer};
use crate::config::{CaptureConfig, ClickerKind};
use crate::detect::{ReferenceColor, Region};
use crate::filter::AffordanceFilter;
use crate::ocr::{TesseractReader, TextReader};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn main() -> Result<()> {
    let cfg = parse_args()?;
    install_interrupt_handler();

    println!("Initializing color capture loop...");
    println!("Captures will be saved to: {}", cfg.captures_dir.display());
    println!("OCR filtering: {}", if cfg.ocr_enabled { "ENABLED" } else { "DISABLED" });
    println!("Debug mode: {}", if cfg.debug { "ON" } else { "OFF" });
    if cfg.ocr_enabled {
        println!("Searching for text: {}", cfg.search_phrases.join(", "));
    }
    println!(
        "Auto-click: {} (preferred mechanism: {})",
        if cfg.auto_click { "ENABLED" } else { "DISABLED" },
        cfg.preferred_clicker
    );
    match helper::find_click_helper() {
        Some(path) => println!("Click helper: FOUND at {}", path.display()),
        None => println!("Click helper: NOT FOUND (will use pointer fallback)"),
    }
    println!();

    let reference = ReferenceColor::load(&cfg.reference_image)
        .context("failed to load the reference color")?;
    if cfg.debug {
        println!("Reference color (RGB): {:?}", reference.channels());
    }

    let reader = if cfg.ocr_enabled {
        let located = TesseractReader::locate();
        match &located {
            Some(reader) => println!("Text recognizer: {}", reader.binary().display()),
            None => eprintln!(
                "warning: text recognizer not found; text-gated regions will be rejected"
            ),
        }
        located
    } else {
        None
    };

    let mut pointer = EnigoPointer::new()?;

    println!("Starting capture loop (press Ctrl+C to stop)...\n");
    run_loop(
        &cfg,
        reference,
        reader.as_ref().map(|reader| reader as &dyn TextReader),
        &mut pointer,
    )
}

/// Idle/Active poll loop: each tick clears the previous artifacts, runs one
/// detect -> filter -> click iteration, then sleeps until the next tick.
fn run_loop(
    cfg: &CaptureConfig,
    reference: ReferenceColor,
    reader: Option<&dyn TextReader>,
    pointer: &mut dyn Pointer,
) -> Result<()> {
    let filter = AffordanceFilter::new(reader, &cfg.search_phrases, cfg.debug);
    let mut iteration: u64 = 0;

    loop {
        if INTERRUPTED.load(Ordering::Relaxed) {
            println!("\nCapture loop stopped by user.");
            return Ok(());
        }
        iteration += 1;

        capture::clear_captures_dir(&cfg.captures_dir);
        println!(
            "Iteration {iteration} | {}",
            chrono::Local::now().format("%H:%M:%S")
        );

        run_iteration(cfg, reference, &filter, pointer)?;

        thread::sleep(cfg.poll_interval());
    }
}

/// One Active phase. Capture and detection problems abort only this
/// iteration; input-simulation failures propagate and end the process.
fn run_iteration(
    cfg: &CaptureConfig,
    reference: ReferenceColor,
    filter: &AffordanceFilter,
    pointer: &mut dyn Pointer,
) -> Result<()> {
    let screen = match capture::capture_screen() {
        Ok(screen) => screen,
        Err(err) => {
            eprintln!("screen capture failed, skipping iteration: {err:#}");
            return Ok(());
        }
    };

    let regions = match detect::detect(&screen, reference, cfg.color_tolerance) {
        Ok(regions) => regions,
        Err(err) => {
            eprintln!("detection failed, skipping iteration: {err}");
            return Ok(());
        }
    };
    println!("Found {} color-matching region(s)", regions.len());
    if regions.is_empty() {
        return Ok(());
    }

    let captures = filter.filter(&screen, &regions);
    if captures.is_empty() {
        println!("No regions passed the filters - captures folder is empty");
        return Ok(());
    }

    let saved = capture::save_captures(&cfg.captures_dir, &captures)?;
    println!("Saved {saved} capture(s) to {}", cfg.captures_dir.display());

    if !cfg.auto_click {
        return Ok(());
    }

    let helper = ExternalClickHelper;
    let mut controller = ClickController::new(
        pointer,
        &helper,
        cfg.preferred_clicker == ClickerKind::Helper,
        cfg.click_delay(),
        cfg.settle_delay(),
        cfg.debug,
    );
    let mut still_present = |region: &Region| match capture::recapture_region(region) {
        Ok(crop) => filter.contains_target_text(&crop),
        // Can't tell; assume the affordance survived so the next tier fires.
        Err(_) => true,
    };
    let outcomes = controller.click_and_verify(&captures, &mut still_present)?;

    let verified = outcomes.iter().filter(|outcome| outcome.succeeded).count();
    println!(
        "Clicked {} region(s) ({verified} verified gone), cursor restored",
        outcomes.len()
    );

    if cfg.debug {
        for outcome in outcomes.iter().filter(|outcome| !outcome.succeeded) {
            if let Ok(crop) = capture::recapture_region(&outcome.region) {
                match capture::save_failure_snapshot(&cfg.captures_dir, &outcome.region, &crop) {
                    Ok(path) => println!("  saved failure snapshot {}", path.display()),
                    Err(err) => eprintln!("  could not save failure snapshot: {err:#}"),
                }
            }
        }
    }
    Ok(())
}

fn parse_args() -> Result<CaptureConfig> {
    let matches = Command::new("clickwatch")
        .version("0.1.0")
        .about("Watches the screen for color-matched dialog buttons, confirms their label text, and clicks them")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("JSON config file; flags below override its fields"),
        )
        .arg(
            Arg::new("reference")
                .long("reference")
                .value_name("IMAGE")
                .help("Reference image whose average RGB is the target color"),
        )
        .arg(
            Arg::new("captures-dir")
                .long("captures-dir")
                .value_name("DIR")
                .help("Directory rewritten with capture artifacts each iteration"),
        )
        .arg(
            Arg::new("tolerance")
                .long("tolerance")
                .value_name("N")
                .value_parser(clap::value_parser!(u8))
                .help("Per-channel color tolerance (0-255)"),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .value_name("MS")
                .value_parser(clap::value_parser!(u64))
                .help("Poll interval between iterations"),
        )
        .arg(
            Arg::new("click-delay-ms")
                .long("click-delay-ms")
                .value_name("MS")
                .value_parser(clap::value_parser!(u64))
                .help("Delay between pointer movement and click"),
        )
        .arg(
            Arg::new("settle-delay-ms")
                .long("settle-delay-ms")
                .value_name("MS")
                .value_parser(clap::value_parser!(u64))
                .help("Pause after a click before re-checking the region"),
        )
        .arg(
            Arg::new("text")
                .long("text")
                .value_name("PHRASE")
                .action(ArgAction::Append)
                .help("Target phrase to search for (repeatable, case-insensitive)"),
        )
        .arg(
            Arg::new("no-ocr")
                .long("no-ocr")
                .action(ArgAction::SetTrue)
                .help("Disable text recognition; the size filter decides alone"),
        )
        .arg(
            Arg::new("no-click")
                .long("no-click")
                .action(ArgAction::SetTrue)
                .help("Detect and save captures without clicking"),
        )
        .arg(
            Arg::new("clicker")
                .long("clicker")
                .value_name("KIND")
                .value_parser(["helper", "pointer"])
                .help("Preferred click mechanism"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Verbose per-region logging"),
        )
        .get_matches();

    let mut cfg = match matches.get_one::<String>("config") {
        Some(path) => CaptureConfig::load(Path::new(path))?,
        None => CaptureConfig::default(),
    };

    if let Some(path) = matches.get_one::<String>("reference") {
        cfg.reference_image = path.into();
    }
    if let Some(dir) = matches.get_one::<String>("captures-dir") {
        cfg.captures_dir = dir.into();
    }
    if let Some(tolerance) = matches.get_one::<u8>("tolerance") {
        cfg.color_tolerance = *tolerance;
    }
    if let Some(interval) = matches.get_one::<u64>("interval-ms") {
        cfg.poll_interval_ms = *interval;
    }
    if let Some(delay) = matches.get_one::<u64>("click-delay-ms") {
        cfg.click_delay_ms = *delay;
    }
    if let Some(settle) = matches.get_one::<u64>("settle-delay-ms") {
        cfg.settle_delay_ms = *settle;
    }
    if let Some(phrases) = matches.get_many::<String>("text") {
        cfg.search_phrases = phrases.cloned().collect();
    }
    if matches.get_flag("no-ocr") {
        cfg.ocr_enabled = false;
    }
    if matches.get_flag("no-click") {
        cfg.auto_click = false;
    }
    if let Some(kind) = matches.get_one::<String>("clicker") {
        cfg.preferred_clicker = kind.parse()?;
    }
    if matches.get_flag("debug") {
        cfg.debug = true;
    }
    Ok(cfg)
}

/// Flags termination requests so the loop can finish its cleanup step and
/// exit with a logged message instead of dying mid-iteration.
#[cfg(unix)]
fn install_interrupt_handler() {
    extern "C" fn on_signal(_signal: libc::c_int) {
        INTERRUPTED.store(true, Ordering::Relaxed);
    }
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_interrupt_handler() {}
