use std::env;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use sha1::{Digest, Sha1};

use famicore::{Cartridge, Console, ConsoleConfig};

struct Config {
    rom: PathBuf,
    frames: u32,
    sample_rate: u32,
    buttons: u8,
}

fn parse_args() -> Result<Config> {
    let mut rom = None;
    let mut frames = 60u32;
    let mut sample_rate = 44_100u32;
    let mut buttons = 0u8;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames" => {
                let value = args.next().context("--frames needs a value")?;
                frames = value.parse().context("--frames must be a number")?;
            }
            "--sample-rate" => {
                let value = args.next().context("--sample-rate needs a value")?;
                sample_rate = value.parse().context("--sample-rate must be a number")?;
            }
            "--buttons" => {
                let value = args.next().context("--buttons needs a hex value")?;
                buttons = u8::from_str_radix(value.trim_start_matches("0x"), 16)
                    .context("--buttons must be a hex bitmask")?;
            }
            "--help" | "-h" => {
                eprintln!(
                    "usage: headless <rom.nes> [--frames N] [--sample-rate HZ] [--buttons HEX]"
                );
                std::process::exit(0);
            }
            other if rom.is_none() => rom = Some(PathBuf::from(other)),
            other => bail!("unexpected argument: {other}"),
        }
    }

    let rom = rom.context("no ROM path given (try --help)")?;
    Ok(Config {
        rom,
        frames,
        sample_rate,
        buttons,
    })
}

fn main() -> Result<()> {
    env_logger::init();
    let config = parse_args()?;

    let cart = Cartridge::from_file(&config.rom)
        .with_context(|| format!("failed to load {}", config.rom.display()))?;
    let rom_md5 = cart.md5;
    let mapper = famicore::mapper::mapper_name(cart.mapper_id);
    let mapper_id = cart.mapper_id;

    let mut console = Console::new(
        cart,
        ConsoleConfig {
            sample_rate: config.sample_rate,
        },
    )?;
    console.set_buttons(0, config.buttons);

    let started = Instant::now();
    let mut audio_samples = 0usize;
    for _ in 0..config.frames {
        console.run_frame();
        audio_samples += console.take_audio().len();
    }
    let elapsed = started.elapsed();

    let mut hasher = Sha1::new();
    for pixel in console.frame() {
        hasher.update(pixel.to_le_bytes());
    }

    println!("rom_md5={} mapper={mapper} (id {mapper_id})", hex(&rom_md5));
    println!(
        "frames={} cycles={} pc=${:04X} audio_samples={}",
        config.frames,
        console.cycles(),
        console.cpu_pc(),
        audio_samples
    );
    println!("framebuffer_sha1={}", hex(&hasher.finalize()));
    println!(
        "wall_time_ms={} ({:.1}x realtime)",
        elapsed.as_millis(),
        config.frames as f64 / 60.0 / elapsed.as_secs_f64().max(1e-9)
    );
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
