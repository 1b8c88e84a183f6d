//! Line-oriented console commands.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Mute,
    Unmute,
    Status,
    Devices,
    Save,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  start     open a session (stops the current one first)
  stop      end the session
  mute      stop sending microphone audio
  unmute    resume sending microphone audio
  status    show session state and counters
  devices   list audio input and output devices
  save      persist current settings
  help      show this message
  quit      stop and exit";

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let word = line.trim().to_ascii_lowercase();
    let command = match word.as_str() {
        "" => return Ok(None),
        "start" | "s" => Command::Start,
        "stop" | "x" => Command::Stop,
        "mute" | "m" => Command::Mute,
        "unmute" | "u" => Command::Unmute,
        "status" | "st" => Command::Status,
        "devices" | "d" => Command::Devices,
        "save" => Command::Save,
        "help" | "h" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command '{other}' (try 'help')")),
    };
    Ok(Some(command))
}
