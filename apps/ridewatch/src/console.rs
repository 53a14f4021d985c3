//! Line commands understood by the console client.

use shared::Role;

use crate::geo::RawSample;

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    ToggleRole,
    SetRole(Role),
    Fix(RawSample),
    Find(String),
    Chat(String),
    Quit,
    Blank,
    Invalid(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ConsoleCommand::Blank;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return ConsoleCommand::Chat(line.to_string());
        };

        let (name, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let args = args.trim();
        match name {
            "role" if args.is_empty() => ConsoleCommand::ToggleRole,
            "role" => match args.parse::<Role>() {
                Ok(role) => ConsoleCommand::SetRole(role),
                Err(err) => ConsoleCommand::Invalid(err.to_string()),
            },
            "at" => parse_fix(args),
            "find" if args.is_empty() => ConsoleCommand::Invalid("usage: /find <place>".into()),
            "find" => ConsoleCommand::Find(args.to_string()),
            "quit" | "exit" => ConsoleCommand::Quit,
            other => ConsoleCommand::Invalid(format!("unknown command /{other}")),
        }
    }
}

fn parse_fix(args: &str) -> ConsoleCommand {
    let usage = || ConsoleCommand::Invalid("usage: /at <lat> <lon> [speed m/s]".into());
    let numbers: Result<Vec<f64>, _> = args.split_whitespace().map(str::parse::<f64>).collect();
    let Ok(numbers) = numbers else {
        return usage();
    };
    match numbers.as_slice() {
        [lat, lon] => ConsoleCommand::Fix(RawSample::at(*lat, *lon)),
        [lat, lon, speed] if *speed >= 0.0 => {
            ConsoleCommand::Fix(RawSample::at(*lat, *lon).with_speed(*speed))
        }
        _ => usage(),
    }
}
