/// Symbolic sleep-prevention options and their translation to and from the
/// caffeinate argument grammar.
use std::fmt;

/// One sleep-prevention directive, mapped onto a single caffeinate flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opt {
    /// Prevent the disk from idle sleeping (`-m`).
    Disk,
    /// Prevent the display from sleeping (`-d`).
    Display,
    /// Prevent the system from idle sleeping (`-i`).
    Idle,
    /// Prevent system sleep entirely (`-s`).
    System,
    /// Assert that the user is active, keeping the display on (`-u`).
    User,
    /// Hold assertions only while the given process is alive (`-w <pid>`).
    Process(u32),
    /// Hold assertions for a fixed number of seconds (`-t <secs>`).
    Timed(u64),
}

/// Payload-less discriminant of an [`Opt`]. Uniqueness checks compare options
/// by kind only; two `Timed` entries conflict even with different durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptKind {
    Disk,
    Display,
    Idle,
    System,
    User,
    Process,
    Timed,
}

impl Opt {
    /// The kind of this option, ignoring any payload.
    pub fn kind(&self) -> OptKind {
        match self {
            Opt::Disk => OptKind::Disk,
            Opt::Display => OptKind::Display,
            Opt::Idle => OptKind::Idle,
            Opt::System => OptKind::System,
            Opt::User => OptKind::User,
            Opt::Process(_) => OptKind::Process,
            Opt::Timed(_) => OptKind::Timed,
        }
    }

    /// The caffeinate argument tokens this option contributes.
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Opt::Disk => vec!["-m".to_string()],
            Opt::Display => vec!["-d".to_string()],
            Opt::Idle => vec!["-i".to_string()],
            Opt::System => vec!["-s".to_string()],
            Opt::User => vec!["-u".to_string()],
            Opt::Process(pid) => vec!["-w".to_string(), pid.to_string()],
            Opt::Timed(secs) => vec!["-t".to_string(), secs.to_string()],
        }
    }
}

impl fmt::Display for OptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptKind::Disk => "disk",
            OptKind::Display => "display",
            OptKind::Idle => "idle",
            OptKind::System => "system",
            OptKind::User => "user",
            OptKind::Process => "process",
            OptKind::Timed => "timed",
        };
        f.write_str(name)
    }
}

/// Errors from parsing argument tokens back into options.
#[derive(Debug)]
pub enum OptParseError {
    /// A token that is not part of the caffeinate flag grammar.
    UnknownFlag { token: String },
    /// A flag that takes a value appeared last, with nothing after it.
    MissingValue { flag: String },
    /// A flag's value did not parse as the expected number.
    InvalidValue { flag: String, value: String },
}

impl fmt::Display for OptParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptParseError::UnknownFlag { token } => {
                write!(f, "unknown option token: {}", token)
            }
            OptParseError::MissingValue { flag } => {
                write!(f, "option {} requires a value", flag)
            }
            OptParseError::InvalidValue { flag, value } => {
                write!(f, "invalid value for option {}: {}", flag, value)
            }
        }
    }
}

impl std::error::Error for OptParseError {}

/// Parse caffeinate argument tokens back into options.
///
/// This is the inverse of [`Opt::to_args`], intended for callers that hold a
/// raw argument list (config files, recorded invocations). Duplicate kinds
/// are not rejected here; that check belongs to session start.
pub fn parse_args<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<Opt>, OptParseError> {
    let mut opts = Vec::new();
    let mut iter = tokens.iter();
    while let Some(token) = iter.next() {
        let token = token.as_ref();
        match token {
            "-m" => opts.push(Opt::Disk),
            "-d" => opts.push(Opt::Display),
            "-i" => opts.push(Opt::Idle),
            "-s" => opts.push(Opt::System),
            "-u" => opts.push(Opt::User),
            "-w" => {
                let value = iter.next().ok_or_else(|| OptParseError::MissingValue {
                    flag: token.to_string(),
                })?;
                let pid = value.as_ref().parse::<u32>().map_err(|_| {
                    OptParseError::InvalidValue {
                        flag: token.to_string(),
                        value: value.as_ref().to_string(),
                    }
                })?;
                opts.push(Opt::Process(pid));
            }
            "-t" => {
                let value = iter.next().ok_or_else(|| OptParseError::MissingValue {
                    flag: token.to_string(),
                })?;
                let secs = value.as_ref().parse::<u64>().map_err(|_| {
                    OptParseError::InvalidValue {
                        flag: token.to_string(),
                        value: value.as_ref().to_string(),
                    }
                })?;
                opts.push(Opt::Timed(secs));
            }
            other => {
                return Err(OptParseError::UnknownFlag {
                    token: other.to_string(),
                })
            }
        }
    }
    Ok(opts)
}

/// Scan an option sequence in order and report the kind of the first option
/// that repeats an earlier kind, if any.
pub fn find_duplicate_kind(opts: &[Opt]) -> Option<OptKind> {
    let mut seen: Vec<OptKind> = Vec::with_capacity(opts.len());
    for opt in opts {
        let kind = opt.kind();
        if seen.contains(&kind) {
            return Some(kind);
        }
        seen.push(kind);
    }
    None
}
