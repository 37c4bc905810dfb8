use std::{
    io::{self, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use rustyline::{
    completion::FilenameCompleter, error::ReadlineError, history::FileHistory, Completer, Editor,
    Helper, Highlighter, Hinter, Validator,
};
use tracing::{error, info, warn};
use vlmrs_core::{config::project_dirs, ChatSession, EngineHandle, Error, Fragment};

const IMAGE_PROMPT: &str = "Image Path (leave empty if no image) >>> ";
const TEXT_PROMPT: &str = "Send a message ... >>> ";
const EXIT_REMINDER: &str = "Please use Ctrl-D or type `exit` to quit.";
const EXIT_COMMANDS: &[&str] = &["exit", "quit", "bye"];

static TERMINATE: AtomicBool = AtomicBool::new(false);

fn exit_handler() {
    println!("\nExiting...");
    vlmrs_core::llama_server::terminate_all();
    std::process::exit(0);
}

fn terminate_handler() {
    TERMINATE.store(true, Ordering::SeqCst);
}

static CTRLC_HANDLER: Lazy<Mutex<&'static (dyn Fn() + Sync)>> =
    Lazy::new(|| Mutex::new(&exit_handler));

fn set_ctrlc_handler(handler: &'static (dyn Fn() + Sync)) {
    if let Ok(mut current) = CTRLC_HANDLER.lock() {
        *current = handler;
    }
}

/// `exit`, `quit` or `bye`, optionally written as a `/` or `\` command.
pub fn is_exit_command(line: &str) -> bool {
    let line = line.trim();
    let word = line
        .strip_prefix('/')
        .or_else(|| line.strip_prefix('\\'))
        .unwrap_or(line);
    EXIT_COMMANDS
        .iter()
        .any(|cmd| cmd.eq_ignore_ascii_case(word))
}

#[derive(Helper, Completer, Hinter, Validator, Highlighter)]
struct PathHelper {
    #[rustyline(Completer)]
    completer: FilenameCompleter,
}

/// Somewhere to read prompt lines from.
pub trait LineSource {
    fn read_line(&mut self, prompt: &str) -> rustyline::Result<String>;
}

impl LineSource for Editor<PathHelper, FileHistory> {
    fn read_line(&mut self, prompt: &str) -> rustyline::Result<String> {
        let line = self.readline(prompt)?;
        if !line.trim().is_empty() {
            let _ = self.add_history_entry(line.as_str());
        }
        Ok(line)
    }
}

fn history_file_path() -> Option<PathBuf> {
    let dirs = project_dirs()?;
    let config_dir = dirs.config_dir();
    if let Err(e) = std::fs::create_dir_all(config_dir) {
        warn!("Could not create {}: {e}", config_dir.display());
        return None;
    }
    Some(config_dir.join("history.txt"))
}

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

enum Input {
    Line(String),
    Restart,
    Exit,
}

fn prompt<L: LineSource, W: Write>(lines: &mut L, out: &mut W, text: &str) -> io::Result<Input> {
    match lines.read_line(text) {
        Ok(line) if is_exit_command(&line) => {
            writeln!(out, "Exiting...")?;
            Ok(Input::Exit)
        }
        Ok(line) => Ok(Input::Line(line.trim().to_string())),
        Err(ReadlineError::Interrupted) => {
            writeln!(out, "{EXIT_REMINDER}")?;
            Ok(Input::Restart)
        }
        Err(ReadlineError::Eof) => {
            writeln!(out, "Exiting...")?;
            Ok(Input::Exit)
        }
        Err(e) => {
            error!("Error reading input: {e:?}");
            Ok(Input::Exit)
        }
    }
}

/// Terminals quote dragged-in paths.
fn unquote(path: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = path
            .strip_prefix(quote)
            .and_then(|p| p.strip_suffix(quote))
        {
            return inner;
        }
    }
    path
}

#[derive(Debug, Default)]
pub struct TurnStats {
    pub fragments: usize,
    pub time_to_first: Option<Duration>,
    pub total: Duration,
}

impl TurnStats {
    pub fn fragments_per_sec(&self) -> f64 {
        let secs = self.total.as_secs_f64();
        if secs > 0.0 {
            self.fragments as f64 / secs
        } else {
            0.0
        }
    }
}

/// Print `stream` as it arrives: the role label once, then every content delta.
/// Stops early, dropping the stream, once `interrupted` is set.
pub fn render_stream<I, W>(
    stream: I,
    out: &mut W,
    interrupted: &AtomicBool,
) -> vlmrs_core::Result<TurnStats>
where
    I: Iterator<Item = vlmrs_core::Result<Fragment>>,
    W: Write,
{
    let start = Instant::now();
    let mut stats = TurnStats::default();
    let mut role_printed = false;
    for fragment in stream {
        if interrupted.load(Ordering::SeqCst) {
            break;
        }
        let fragment = fragment?;
        stats.fragments += 1;
        stats.time_to_first.get_or_insert_with(|| start.elapsed());
        if let Fragment::Role(_) = fragment {
            if role_printed {
                continue;
            }
            role_printed = true;
        }
        write!(out, "{fragment}")?;
        out.flush()?;
    }
    stats.total = start.elapsed();
    Ok(stats)
}

/// One image prompt, one text prompt, one streamed reply.
pub fn run_turn<H, L, W>(
    session: &ChatSession<H>,
    lines: &mut L,
    out: &mut W,
    profiling: bool,
) -> io::Result<Flow>
where
    H: EngineHandle,
    L: LineSource,
    W: Write,
{
    let image = match prompt(lines, out, IMAGE_PROMPT)? {
        Input::Line(line) => line,
        Input::Restart => return Ok(Flow::Continue),
        Input::Exit => return Ok(Flow::Exit),
    };
    let image = Some(PathBuf::from(unquote(&image))).filter(|_| !image.is_empty());
    let image = match image {
        Some(path) if !path.exists() => {
            writeln!(out, "'{}' is not a path to image. Will ignore.", path.display())?;
            None
        }
        image => image,
    };

    let text = match prompt(lines, out, TEXT_PROMPT)? {
        Input::Line(line) => line,
        Input::Restart => return Ok(Flow::Continue),
        Input::Exit => return Ok(Flow::Exit),
    };

    TERMINATE.store(false, Ordering::SeqCst);
    set_ctrlc_handler(&terminate_handler);
    let result = session
        .converse(Some(text.as_str()), image.as_deref())
        .and_then(|stream| render_stream(stream, &mut *out, &TERMINATE));
    set_ctrlc_handler(&exit_handler);

    match result {
        Ok(stats) => {
            writeln!(out)?;
            if profiling {
                print_stats(out, &stats)?;
            }
        }
        Err(Error::EmptyInput) => writeln!(out, "Please provide an image or text input.")?,
        Err(e) => error!("Error during generation: {e:?}"),
    }
    writeln!(out)?;
    Ok(Flow::Continue)
}

fn print_stats<W: Write>(out: &mut W, stats: &TurnStats) -> io::Result<()> {
    let first = stats
        .time_to_first
        .map_or_else(|| "-".to_string(), |d| format!("{:.2}s", d.as_secs_f64()));
    writeln!(
        out,
        "Time to first fragment: {first}, {:.2} fragments/s ({} in {:.2}s)",
        stats.fragments_per_sec(),
        stats.fragments,
        stats.total.as_secs_f64()
    )
}

/// Route Ctrl-C through [`CTRLC_HANDLER`]: exit while idle, abort the turn while generating.
/// Install before loading so an interrupted load also stops the engine.
pub fn install_ctrlc_handler() -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        if let Ok(handler) = CTRLC_HANDLER.lock() {
            handler()
        }
    })?;
    Ok(())
}

/// Chat in the terminal until the user exits.
pub fn interactive_mode<H: EngineHandle>(
    session: &ChatSession<H>,
    profiling: bool,
) -> anyhow::Result<()> {
    let mut editor: Editor<PathHelper, FileHistory> = Editor::new()?;
    editor.set_helper(Some(PathHelper {
        completer: FilenameCompleter::new(),
    }));
    let history = history_file_path();
    if let Some(path) = &history {
        if editor.load_history(path).is_err() {
            info!("Starting a new prompt history at {}", path.display());
        }
    }

    let mut stdout = io::stdout();
    while run_turn(session, &mut editor, &mut stdout, profiling)? == Flow::Continue {}

    if let Some(path) = &history {
        if let Err(e) = editor.save_history(path) {
            warn!("Could not save prompt history: {e}");
        }
    }
    Ok(())
}
