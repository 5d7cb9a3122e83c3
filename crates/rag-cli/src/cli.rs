use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOptions {
    pub rebuild: bool,
    pub session_id: Option<String>,
    pub stream: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("unknown argument: {0}")]
    UnknownArgument(String),
    #[error("missing value for argument: {0}")]
    MissingValue(String),
    #[error("--session value must not be blank")]
    BlankSession,
    #[error("help requested")]
    HelpRequested,
}

impl CliOptions {
    pub fn parse<I>(args: I) -> Result<Self, CliError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Self::default();

        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--help" | "-h" => return Err(CliError::HelpRequested),
                "--rebuild" => options.rebuild = true,
                "--stream" => options.stream = true,
                "--session" => {
                    let value = iter.next().ok_or(CliError::MissingValue(arg.clone()))?;
                    let value = value.trim();
                    if value.is_empty() {
                        return Err(CliError::BlankSession);
                    }
                    options.session_id = Some(value.to_string());
                }
                unknown => return Err(CliError::UnknownArgument(unknown.to_string())),
            }
        }

        Ok(options)
    }
}

/// What one line typed at the prompt asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLine<'a> {
    Quit,
    Skip,
    Question(&'a str),
}

pub fn classify_input(line: &str) -> InputLine<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return InputLine::Skip;
    }
    if trimmed.eq_ignore_ascii_case("exit") || trimmed.eq_ignore_ascii_case("quit") {
        return InputLine::Quit;
    }
    InputLine::Question(trimmed)
}
