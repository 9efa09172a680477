use anyhow::Result;
use phosphor8::nes::{Nes, cpu};
use std::path::Path;

fn disassemble_at(nes: &Nes, addr: u16) -> (String, u16) {
    let opcode = nes.debug_peek_cpu_bus(addr);
    let (name, bytes) = cpu::describe_opcode(opcode);
    let mut raw = String::new();
    for i in 0..bytes {
        raw.push_str(&format!(
            "{:02X} ",
            nes.debug_peek_cpu_bus(addr.wrapping_add(u16::from(i)))
        ));
    }
    (
        format!("${addr:04X}: {raw:<9} {name}"),
        addr.wrapping_add(u16::from(bytes)),
    )
}

fn main() -> Result<()> {
    println!("Phosphor-8 Console Debugger");
    println!("===========================");
    println!();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        println!("Usage: phosphor8_debug <rom.nes>");
        println!();
        println!("Commands:");
        println!("  step          - Step one instruction");
        println!("  run           - Run a frame per prompt");
        println!("  frame [n]     - Run n frames (default 1)");
        println!("  regs          - Show CPU registers");
        println!("  mem <addr>    - Show memory at address");
        println!("  dis [addr]    - Disassemble from address (default PC)");
        println!("  ppu           - Show PPU state");
        println!("  events [n]    - Show recent debug events");
        println!("  counters      - Show bus and PPU counters");
        println!("  quit          - Exit debugger");
        return Ok(());
    }

    let rom_path = &args[1];
    println!("Loading ROM: {}", rom_path);

    let mut nes = Nes::new();
    nes.load_rom_from_path(Path::new(rom_path))?;

    println!("ROM loaded successfully!");
    println!("Mapper: {}", nes.mapper_name());
    println!();

    let (a, x, y, p, sp, pc) = nes.debug_cpu_regs();
    println!("Initial state:");
    println!("PC: ${pc:04X}  A: {a:02X}  X: {x:02X}  Y: {y:02X}  P: {p:02X}  SP: {sp:02X}");

    println!();
    println!("Type 'help' for commands, 'run' to start emulation");

    let mut running = false;

    loop {
        if running {
            nes.run_frame();
            let (pending, stall) = nes.debug_interrupt_state();
            if pending.is_some() || stall > 0 {
                println!("Pending interrupt: {:?}, stall: {}", pending, stall);
            }
            println!(
                "Frame {} complete, PC=${:04X}",
                nes.debug_counters().frame_count,
                nes.debug_pc()
            );
        }

        print!("> ");
        std::io::Write::flush(&mut std::io::stdout()).ok();

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        let input = input.trim();

        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0] {
            "help" => {
                println!("Commands:");
                println!("  step, s      - Step one instruction");
                println!("  run, r       - Run a frame per prompt");
                println!("  stop         - Stop running");
                println!("  frame [n]    - Run n frames (default 1)");
                println!("  regs         - Show CPU registers");
                println!("  mem <addr>   - Show memory bytes (hex)");
                println!("  dis [addr]   - Disassemble from address (default PC)");
                println!("  ppu          - Show PPU state");
                println!("  events [n]   - Show recent debug events (default 16)");
                println!("  counters     - Show bus and PPU counters");
                println!("  mapper       - Show mapper name");
                println!("  quit, q      - Exit debugger");
            }
            "step" | "s" => {
                let (line, _) = disassemble_at(&nes, nes.debug_pc());
                let cycles = nes.step();
                println!("{line}  ({cycles} cycles)");
                let (a, x, y, p, sp, pc) = nes.debug_cpu_regs();
                println!(
                    "PC: ${pc:04X}  A: {a:02X}  X: {x:02X}  Y: {y:02X}  P: {p:02X}  SP: {sp:02X}"
                );
            }
            "run" | "r" => {
                running = true;
                println!("Running...");
            }
            "stop" => {
                running = false;
                println!("Stopped");
            }
            "frame" => {
                let count = parts
                    .get(1)
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(1);
                for _ in 0..count {
                    nes.run_frame();
                }
                println!(
                    "Ran {} frame(s), total {}, PC=${:04X}",
                    count,
                    nes.debug_counters().frame_count,
                    nes.debug_pc()
                );
            }
            "regs" => {
                let (a, x, y, p, sp, pc) = nes.debug_cpu_regs();
                println!("A: ${:02X}  X: ${:02X}  Y: ${:02X}", a, x, y);
                println!("P: {:08b} (NVRBDIZC)", p);
                println!("SP: ${:02X}  PC: ${:04X}", sp, pc);
                println!(
                    "Flags: N={} V={} D={} I={} Z={} C={}",
                    (p & 0x80) != 0,
                    (p & 0x40) != 0,
                    (p & 0x08) != 0,
                    (p & 0x04) != 0,
                    (p & 0x02) != 0,
                    (p & 0x01) != 0
                );
                println!("Cycles: {}", nes.debug_total_cycles());
            }
            "mem" => {
                if parts.len() >= 2 {
                    if let Ok(addr) = u16::from_str_radix(parts[1].trim_start_matches("0x"), 16) {
                        println!("Memory ${:04X}-${:04X}:", addr, addr.wrapping_add(15));
                        let mut s = String::new();
                        for i in 0..16 {
                            let a = addr.wrapping_add(i);
                            if i % 8 == 0 {
                                if i > 0 {
                                    println!("{}", s);
                                    s = String::new();
                                }
                                s.push_str(&format!("{:04X}: ", a));
                            }
                            s.push_str(&format!("{:02X} ", nes.debug_peek_cpu_bus(a)));
                        }
                        println!("{}", s);
                    }
                } else {
                    println!("Usage: mem <addr>");
                }
            }
            "dis" => {
                let mut addr = if parts.len() >= 2 {
                    u16::from_str_radix(parts[1].trim_start_matches("0x"), 16)
                        .unwrap_or_else(|_| nes.debug_pc())
                } else {
                    nes.debug_pc()
                };
                for _ in 0..8 {
                    let (line, next) = disassemble_at(&nes, addr);
                    println!("{line}");
                    addr = next;
                }
            }
            "ppu" => {
                let (scanline, cycle) = nes.debug_ppu_scanline_cycle();
                let (ctrl, mask, status) = nes.debug_ppu_regs();
                let (v, t, fine_x, write_toggle) = nes.debug_ppu_scroll_state();
                println!("PPU State:");
                println!("  Scanline: {}, Cycle: {}", scanline, cycle);
                println!("  $2000 (ctrl):  {:08b}", ctrl);
                println!("  $2001 (mask):  {:08b}", mask);
                println!("  $2002 (status): {:08b}", status);
                println!("  v=${v:04X} t=${t:04X} fine_x={fine_x} write_toggle={write_toggle}");
            }
            "events" => {
                let limit = parts
                    .get(1)
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(16);
                let events = nes.debug_recent_events(limit);
                if events.is_empty() {
                    println!("No events recorded");
                }
                for event in events {
                    println!("  {event}");
                }
            }
            "counters" => {
                let c = nes.debug_counters();
                let p = nes.debug_ppu_counters();
                println!("Bus counters:");
                println!(
                    "  frames={} slices={} reads={} writes={} dma={} nmi={}",
                    c.frame_count, c.run_slices, c.cpu_reads, c.cpu_writes, c.dma_transfers,
                    c.nmi_delivered
                );
                println!(
                    "  reads ram/ppu/io/cart = {}/{}/{}/{}",
                    c.cpu_reads_ram, c.cpu_reads_ppu_regs, c.cpu_reads_io, c.cpu_reads_cart
                );
                println!(
                    "  writes ram/ppu/io/cart = {}/{}/{}/{}",
                    c.cpu_writes_ram, c.cpu_writes_ppu_regs, c.cpu_writes_io, c.cpu_writes_cart
                );
                println!("PPU counters:");
                println!(
                    "  ticks={} frames={} nmi_edges={} s0_hits={} overflows={}",
                    p.ticks, p.frames, p.nmi_edges, p.sprite_zero_hits, p.sprite_overflows
                );
                println!(
                    "  status_reads={} data_reads={} data_writes={} register_writes={}",
                    p.status_reads, p.data_reads, p.data_writes, p.register_writes
                );
            }
            "mapper" => {
                println!("Mapper: {}", nes.mapper_name());
            }
            "quit" | "q" => {
                println!("Goodbye!");
                break;
            }
            _ => {
                println!(
                    "Unknown command: {}. Type 'help' for available commands.",
                    parts[0]
                );
            }
        }
    }

    Ok(())
}
