use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use phosphor8::nes::cpu::{Bus, Cpu};

/// Flat 64 KiB memory with no devices, for CPU-only test images.
struct FlatMemory {
    bytes: Box<[u8; 65536]>,
}

impl FlatMemory {
    fn new() -> Self {
        Self {
            bytes: Box::new([0u8; 65536]),
        }
    }
}

impl Bus for FlatMemory {
    fn read(&mut self, addr: u16, _now: u64) -> u8 {
        self.bytes[addr as usize]
    }

    fn write(&mut self, addr: u16, value: u8, _now: u64) {
        self.bytes[addr as usize] = value;
    }
}

#[derive(Debug, Clone)]
struct Config {
    image: PathBuf,
    load_address: u16,
    start_pc: u16,
    success_pc: u16,
    max_cycles: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image: PathBuf::from("external/roms/6502_functional_test.bin"),
            load_address: 0x0000,
            start_pc: 0x0400,
            success_pc: 0x3399,
            max_cycles: 100_000_000,
        }
    }
}

fn parse_hex_u16(value: &str) -> Result<u16> {
    let trimmed = value.trim_start_matches("0x").trim_start_matches('$');
    u16::from_str_radix(trimmed, 16).with_context(|| format!("invalid hex address: {value}"))
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--image" => {
                let value = args.next().context(
                    "--image requires a path, e.g. --image external/roms/6502_functional_test.bin",
                )?;
                cfg.image = PathBuf::from(value);
            }
            "--load-address" => {
                let value = args
                    .next()
                    .context("--load-address requires a hex address, e.g. --load-address 0x0000")?;
                cfg.load_address = parse_hex_u16(&value)?;
            }
            "--start-pc" => {
                let value = args
                    .next()
                    .context("--start-pc requires a hex address, e.g. --start-pc 0x0400")?;
                cfg.start_pc = parse_hex_u16(&value)?;
            }
            "--success-pc" => {
                let value = args
                    .next()
                    .context("--success-pc requires a hex address, e.g. --success-pc 0x3399")?;
                cfg.success_pc = parse_hex_u16(&value)?;
            }
            "--max-cycles" => {
                let value = args
                    .next()
                    .context("--max-cycles requires an integer, e.g. --max-cycles 100000000")?;
                cfg.max_cycles = value
                    .parse::<u64>()
                    .with_context(|| format!("invalid --max-cycles value: {value}"))?;
            }
            "--help" | "-h" => {
                println!(
                    "cpu_functional\n\n\
Runs a raw 6502 test image on the CPU core alone, no console attached.\n\
Use an image assembled with decimal mode disabled; this core has the\n\
2A03 behavior of ignoring the D flag in ADC/SBC.\n\n\
Usage:\n\
  cargo run --release --bin cpu_functional -- [options]\n\n\
Options:\n\
  --image <path>        Test image (default external/roms/6502_functional_test.bin)\n\
  --load-address <hex>  Where to place the image (default 0x0000)\n\
  --start-pc <hex>      Initial PC (default 0x0400)\n\
  --success-pc <hex>    PC that marks success (default 0x3399)\n\
  --max-cycles <n>      Cycle budget (default 100000000)\n\
  -h, --help            Show this help\n"
                );
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    Ok(cfg)
}

fn dump_state(cpu: &Cpu, memory: &FlatMemory) {
    println!(
        "PC=${:04X} A=${:02X} X=${:02X} Y=${:02X} P=${:02X} SP=${:02X} cycles={}",
        cpu.pc,
        cpu.a,
        cpu.x,
        cpu.y,
        cpu.p,
        cpu.sp,
        cpu.cycles()
    );
    // The functional test keeps its current case number at $0200.
    println!("test case byte [$0200]=${:02X}", memory.bytes[0x0200]);
}

fn main() -> Result<()> {
    let cfg = parse_args()?;

    let image = fs::read(&cfg.image)
        .with_context(|| format!("failed to read test image {}", cfg.image.display()))?;
    let base = cfg.load_address as usize;
    if base + image.len() > 65536 {
        anyhow::bail!(
            "image of {} bytes does not fit at ${:04X}",
            image.len(),
            cfg.load_address
        );
    }

    let mut memory = FlatMemory::new();
    memory.bytes[base..base + image.len()].copy_from_slice(&image);

    let mut cpu = Cpu::new();
    cpu.pc = cfg.start_pc;

    println!(
        "Running {} from ${:04X}, success at ${:04X}",
        cfg.image.display(),
        cfg.start_pc,
        cfg.success_pc
    );

    let start = Instant::now();
    let mut next_progress = 10_000_000u64;

    while cpu.cycles() < cfg.max_cycles {
        let before = cpu.pc;
        cpu.run(&mut memory, 0);

        if cpu.pc == cfg.success_pc {
            println!(
                "PASS after {} cycles ({:.2}s)",
                cpu.cycles(),
                start.elapsed().as_secs_f32()
            );
            return Ok(());
        }

        // The image marks a failed case by jumping to itself.
        if cpu.pc == before {
            println!("TRAP: PC stuck");
            dump_state(&cpu, &memory);
            anyhow::bail!("functional test trapped at ${:04X}", cpu.pc);
        }

        if cpu.cycles() >= next_progress {
            println!("... {} cycles, PC=${:04X}", cpu.cycles(), cpu.pc);
            next_progress += 10_000_000;
        }
    }

    println!("TIMEOUT after {} cycles", cpu.cycles());
    dump_state(&cpu, &memory);
    anyhow::bail!("functional test did not finish within the cycle budget");
}
