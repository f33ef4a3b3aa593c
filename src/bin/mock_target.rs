//! Mock target executable for integration testing
//!
//! Stands in for the program under test. It takes the single `k=v;k=v`
//! argument the harness passes and answers with `key=value` lines, so
//! extraction and assertions can be exercised without a real target.
//!
//! Every pair is echoed back as `Key=Value`. A few keys steer behavior:
//! - `sleep_ms`: wait before answering
//! - `exit`: exit code to return
//! - `stderr`: text written to stderr
//! - `echo`: when `false`, suppress the pair echo
//! - `Command`: `login` also prints a `SessionId`, `fail` a non-zero `Result`
//!
//! Unless set by a pair, `Result=0` is printed first.

use std::io::Write;
use std::time::Duration;

fn parse(arg: &str) -> Vec<(String, String)> {
    arg.split(';')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.to_string()),
            None => (pair.trim().to_string(), String::new()),
        })
        .collect()
}

fn get<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

fn main() {
    let arg = std::env::args().nth(1).unwrap_or_default();
    let pairs = parse(&arg);

    if let Some(ms) = get(&pairs, "sleep_ms").and_then(|v| v.parse::<u64>().ok()) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let command = get(&pairs, "Command").unwrap_or_default().to_ascii_lowercase();
    if get(&pairs, "Result").is_none() {
        let code = if command == "fail" { 99 } else { 0 };
        let _ = writeln!(out, "Result={}", code);
    }
    if command == "login" {
        let user = get(&pairs, "User").unwrap_or("anonymous");
        let _ = writeln!(out, "SessionId=sess-{}-{}", user, std::process::id());
        let _ = writeln!(out, "ServerInfo=mock-target/1.0");
    }
    if command == "fail" {
        let _ = writeln!(out, "ErrorMessage=requested failure");
    }

    if get(&pairs, "echo") != Some("false") {
        const KNOBS: [&str; 4] = ["sleep_ms", "exit", "stderr", "echo"];
        for (k, v) in &pairs {
            if !KNOBS.iter().any(|knob| k.eq_ignore_ascii_case(knob)) {
                let _ = writeln!(out, "{}={}", k, v);
            }
        }
    }
    let _ = out.flush();

    if let Some(text) = get(&pairs, "stderr") {
        eprintln!("{}", text);
    }

    let code = get(&pairs, "exit")
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);
    std::process::exit(code);
}
