use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use phosphor8::nes::Nes;
use quick_xml::Reader;
use quick_xml::events::Event;
use serde::Serialize;
use sha1::{Digest, Sha1};

#[derive(Debug, Clone)]
struct SuiteTest {
    filename: String,
    system: String,
    runframes: u32,
    framesha1: String,
}

#[derive(Debug, Clone)]
struct RunSummary {
    framesha1: String,
    pc: u16,
    total_cycles: u64,
    ppu_ctrl: u8,
    ppu_mask: u8,
    ppu_status: u8,
    ppu_scanline: u16,
    ppu_cycle: u16,
    nmi_delivered: u64,
    ram_f8: u8,
    vram_2000: u8,
    attr_23c0: u8,
    pal_00: u8,
    vram_non_blank_count: usize,
}

#[derive(Debug, Clone, Serialize)]
struct TestReport {
    filename: String,
    runframes: u32,
    outcome: String,
    framesha1: String,
    pc: String,
    total_cycles: u64,
    nmi_delivered: u64,
}

#[derive(Debug, Clone)]
struct Config {
    suite: PathBuf,
    rom_root: PathBuf,
    max_tests: usize,
    include_pal: bool,
    contains: Vec<String>,
    frame_multiplier: u32,
    extra_frames: u32,
    record: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            suite: PathBuf::from("external/nes-test-roms/test_roms.xml"),
            rom_root: PathBuf::from("external/nes-test-roms"),
            max_tests: 80,
            include_pal: false,
            contains: Vec::new(),
            frame_multiplier: 1,
            extra_frames: 0,
            record: None,
        }
    }
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--suite" => {
                let value = args.next().context(
                    "--suite requires a path, e.g. --suite external/nes-test-roms/test_roms.xml",
                )?;
                cfg.suite = PathBuf::from(value);
            }
            "--rom-root" => {
                let value = args.next().context(
                    "--rom-root requires a path, e.g. --rom-root external/nes-test-roms",
                )?;
                cfg.rom_root = PathBuf::from(value);
            }
            "--max-tests" => {
                let value = args
                    .next()
                    .context("--max-tests requires an integer, e.g. --max-tests 120")?;
                cfg.max_tests = value
                    .parse::<usize>()
                    .with_context(|| format!("invalid --max-tests value: {value}"))?;
            }
            "--include-pal" => cfg.include_pal = true,
            "--contains" => {
                let value = args
                    .next()
                    .context("--contains requires a substring, e.g. --contains vbl_nmi_timing")?;
                cfg.contains.push(value.to_lowercase());
            }
            "--frame-multiplier" => {
                let value = args
                    .next()
                    .context("--frame-multiplier requires an integer, e.g. --frame-multiplier 2")?;
                cfg.frame_multiplier = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --frame-multiplier value: {value}"))?;
            }
            "--extra-frames" => {
                let value = args
                    .next()
                    .context("--extra-frames requires an integer, e.g. --extra-frames 120")?;
                cfg.extra_frames = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --extra-frames value: {value}"))?;
            }
            "--record" => {
                let value = args
                    .next()
                    .context("--record requires a path, e.g. --record report.json")?;
                cfg.record = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
        }
    }

    Ok(cfg)
}

fn print_help() {
    println!(
        "ROM suite runner for Phosphor-8\n\n\
Usage:\n\
  cargo run --bin rom_test_runner -- [options]\n\n\
Options:\n\
  --suite <path>                 Path to the suite XML manifest\n\
  --rom-root <path>              Root path containing ROM files\n\
  --max-tests <n>                Maximum number of tests to run (default 80)\n\
  --include-pal                  Include PAL tests\n\
  --contains <substr>            Only run tests whose filename contains this text (repeatable)\n\
  --frame-multiplier <n>         Multiply manifest runframes by n (default 1)\n\
  --extra-frames <n>             Add n frames after manifest runframes (default 0)\n\
  --record <path>                Write a JSON report of every run, with computed hashes\n\
  -h, --help                     Show this help\n"
    );
}

fn parse_suite_xml(path: &Path) -> Result<Vec<SuiteTest>> {
    let xml = fs::read_to_string(path)
        .with_context(|| format!("failed to read suite XML: {}", path.display()))?;

    let mut reader = Reader::from_str(&xml);
    reader.config_mut().trim_text(true);

    let mut tests = Vec::new();
    let mut current: Option<SuiteTest> = None;
    let mut reading_framesha1 = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name();
                if name.as_ref() == b"test" {
                    let mut filename = String::new();
                    let mut system = String::new();
                    let mut runframes = 0u32;

                    for attr in e.attributes().flatten() {
                        let key = attr.key.as_ref();
                        let value = attr
                            .decode_and_unescape_value(reader.decoder())
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        match key {
                            b"filename" => filename = value,
                            b"system" => system = value,
                            b"runframes" => runframes = value.parse::<u32>().unwrap_or(0),
                            _ => {}
                        }
                    }

                    current = Some(SuiteTest {
                        filename,
                        system,
                        runframes,
                        framesha1: String::new(),
                    });
                } else if name.as_ref() == b"framesha1" {
                    reading_framesha1 = true;
                }
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .decode()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| String::new());
                if let Some(test) = current.as_mut()
                    && reading_framesha1
                {
                    test.framesha1.push_str(&text);
                }
            }
            Ok(Event::CData(e)) => {
                let text = e
                    .decode()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| String::new());
                if let Some(test) = current.as_mut()
                    && reading_framesha1
                {
                    test.framesha1.push_str(&text);
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                if name.as_ref() == b"framesha1" {
                    reading_framesha1 = false;
                } else if name.as_ref() == b"test" {
                    if let Some(mut test) = current.take() {
                        test.framesha1 = test.framesha1.trim().to_string();
                        tests.push(test);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                anyhow::bail!("failed to parse suite XML: {err}");
            }
            _ => {}
        }
    }

    Ok(tests)
}

fn should_run(test: &SuiteTest, cfg: &Config) -> bool {
    if !cfg.include_pal && test.system.eq_ignore_ascii_case("pal") {
        return false;
    }

    if !cfg.contains.is_empty() {
        let lower = test.filename.to_lowercase();
        if !cfg.contains.iter().any(|f| lower.contains(f)) {
            return false;
        }
    }

    true
}

/// SHA-1 of the palette-index framebuffer, base64 encoded to match the
/// manifest format.
fn hash_frame(frame: &[u8]) -> String {
    let digest = Sha1::digest(frame);
    BASE64_STANDARD.encode(digest)
}

fn run_single(test: &SuiteTest, cfg: &Config) -> Result<RunSummary> {
    let rom_path = cfg.rom_root.join(&test.filename);
    let mut nes = Nes::new();
    nes.load_rom_from_path(&rom_path)
        .with_context(|| format!("failed to load ROM {}", rom_path.display()))?;

    let total_frames = test
        .runframes
        .saturating_mul(cfg.frame_multiplier)
        .saturating_add(cfg.extra_frames);
    for _ in 0..total_frames {
        nes.run_frame();
    }

    let (ppu_ctrl, ppu_mask, ppu_status) = nes.debug_ppu_regs();
    let (ppu_scanline, ppu_cycle) = nes.debug_ppu_scanline_cycle();
    let mut vram_non_blank_count = 0usize;
    for i in 0..960 {
        if nes.debug_peek_vram(i) != 0x00 && nes.debug_peek_vram(i) != 0x20 {
            vram_non_blank_count += 1;
        }
    }

    Ok(RunSummary {
        framesha1: hash_frame(nes.frame_buffer()),
        pc: nes.debug_pc(),
        total_cycles: nes.debug_total_cycles(),
        ppu_ctrl,
        ppu_mask,
        ppu_status,
        ppu_scanline,
        ppu_cycle,
        nmi_delivered: nes.debug_counters().nmi_delivered,
        ram_f8: nes.debug_peek_internal_ram(0x00F8),
        vram_2000: nes.debug_peek_vram(0),
        attr_23c0: nes.debug_peek_vram(0x03C0),
        pal_00: nes.debug_peek_palette(0),
        vram_non_blank_count,
    })
}

fn suite_result_pass(test: &SuiteTest, summary: &RunSummary) -> bool {
    // Blargg VBL/NMI timing ROMs expose result status in RAM ($00F8).
    test.filename.starts_with("vbl_nmi_timing/") && summary.ram_f8 == 0x01
}

fn main() -> Result<()> {
    let cfg = parse_args()?;

    let start = Instant::now();
    let tests = parse_suite_xml(&cfg.suite)?;

    let selected: Vec<SuiteTest> = tests
        .into_iter()
        .filter(|t| should_run(t, &cfg))
        .take(cfg.max_tests)
        .collect();

    println!(
        "Running {} test(s) from {}",
        selected.len(),
        cfg.suite.display()
    );

    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;
    let mut reports: Vec<TestReport> = Vec::with_capacity(selected.len());

    for (idx, test) in selected.iter().enumerate() {
        let label = format!("[{}/{}] {}", idx + 1, selected.len(), test.filename);
        match run_single(test, &cfg) {
            Ok(summary) => {
                let outcome = if summary.framesha1 == test.framesha1 {
                    passed += 1;
                    println!("PASS {label} [frame]");
                    "pass"
                } else if suite_result_pass(test, &summary) {
                    passed += 1;
                    println!("PASS {label} [suite-result]");
                    "pass"
                } else {
                    failed += 1;
                    println!(
                        "FAIL {label}\n  expected: {}\n  got     : {}\n  pc=${:04X} cycles={} nmi_delivered={}\n  ppu ctrl=${:02X} mask=${:02X} status=${:02X} sl={} cy={}\n  ram[$00F8]=${:02X} vram[$2000]=${:02X} attr[$23C0]=${:02X} pal[0]=${:02X} nametable_non_blank={}",
                        test.framesha1,
                        summary.framesha1,
                        summary.pc,
                        summary.total_cycles,
                        summary.nmi_delivered,
                        summary.ppu_ctrl,
                        summary.ppu_mask,
                        summary.ppu_status,
                        summary.ppu_scanline,
                        summary.ppu_cycle,
                        summary.ram_f8,
                        summary.vram_2000,
                        summary.attr_23c0,
                        summary.pal_00,
                        summary.vram_non_blank_count
                    );
                    "fail"
                };

                reports.push(TestReport {
                    filename: test.filename.clone(),
                    runframes: test.runframes,
                    outcome: outcome.to_string(),
                    framesha1: summary.framesha1.clone(),
                    pc: format!("{:04X}", summary.pc),
                    total_cycles: summary.total_cycles,
                    nmi_delivered: summary.nmi_delivered,
                });
            }
            Err(err) => {
                skipped += 1;
                println!("SKIP {label} -> {err}");
                reports.push(TestReport {
                    filename: test.filename.clone(),
                    runframes: test.runframes,
                    outcome: format!("skip: {err}"),
                    framesha1: String::new(),
                    pc: String::new(),
                    total_cycles: 0,
                    nmi_delivered: 0,
                });
            }
        }
    }

    if let Some(path) = &cfg.record {
        let json =
            serde_json::to_string_pretty(&reports).context("failed to serialize run report")?;
        fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        println!("Wrote report: {}", path.display());
    }

    let elapsed = start.elapsed().as_secs_f32();
    println!();
    println!("Summary:");
    println!("- Passed: {passed}");
    println!("- Failed: {failed}");
    println!("- Skipped: {skipped}");
    println!("- Runtime: {:.2}s", elapsed);

    Ok(())
}
