//! Stand-in child process for the integration tests.
//!
//! Flags run in order, so `--print hello --sleep-ms 100 --exit 3` prints,
//! waits, then exits with status 3.

use std::{
    env,
    io::{self, Write},
    process, thread,
    time::Duration,
};

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> String {
    args.next().unwrap_or_else(|| {
        eprintln!("missing value for {flag}");
        process::exit(2);
    })
}

fn parse<T: std::str::FromStr>(raw: String, flag: &str) -> T {
    raw.parse().unwrap_or_else(|_| {
        eprintln!("invalid value for {flag}: {raw}");
        process::exit(2);
    })
}

fn write_repeated(mut writer: impl Write, mut bytes: usize, fill: u8) -> io::Result<()> {
    let buf = [fill; 8 * 1024];
    while bytes > 0 {
        let n = bytes.min(buf.len());
        writer.write_all(&buf[..n])?;
        bytes -= n;
    }
    writer.flush()
}

fn spawn_child_sleep(ms: u64) {
    let exe = env::current_exe().unwrap_or_else(|err| {
        eprintln!("failed to resolve current exe: {err}");
        process::exit(2);
    });
    let _child = process::Command::new(exe)
        .args(["--sleep-ms", &ms.to_string()])
        .spawn()
        .unwrap_or_else(|err| {
            eprintln!("failed to spawn child: {err}");
            process::exit(2);
        });
}

fn main() {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--print" => {
                let text = value(&mut args, "--print");
                println!("{text}");
                let _ = io::stdout().flush();
            }
            "--eprint" => {
                let text = value(&mut args, "--eprint");
                eprintln!("{text}");
            }
            "--stdout-bytes" => {
                let bytes: usize = parse(value(&mut args, "--stdout-bytes"), "--stdout-bytes");
                let _ = write_repeated(io::stdout().lock(), bytes, b'a');
            }
            "--sleep-ms" => {
                let ms: u64 = parse(value(&mut args, "--sleep-ms"), "--sleep-ms");
                thread::sleep(Duration::from_millis(ms));
            }
            "--spawn-child-sleep-ms" => {
                let ms: u64 = parse(value(&mut args, "--spawn-child-sleep-ms"), "--spawn-child-sleep-ms");
                spawn_child_sleep(ms);
            }
            "--exit" => {
                let code: i32 = parse(value(&mut args, "--exit"), "--exit");
                process::exit(code);
            }
            other => {
                eprintln!("unknown argument: {other}");
                process::exit(2);
            }
        }
    }
}
