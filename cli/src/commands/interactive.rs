//! Interactive generation with the model held in memory

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use zimage_core::{ArtifactWriter, Config, Error, GenerationRequest, GenerationResult};
use zimage_runtime_diffusion::{select_device, DiffusionRuntime, ZImageLoader};

const SET_USAGE: &str =
    "usage: set steps <n> | set size <w> <h> | set seed <n|random> | set negative <text|none>";
const RULE: &str = "------------------------------------------------------------";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Empty,
    Generate(String),
    Help,
    Settings,
    SetSteps(u32),
    SetSize(u32, u32),
    /// `None` switches back to a random seed per image
    SetSeed(Option<u64>),
    SetNegative(Option<String>),
    Save,
    Quit,
}

/// Parse one input line. Anything that is not a command is a prompt.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }

    match line.to_lowercase().as_str() {
        "q" | "quit" | "exit" => return Ok(Command::Quit),
        "help" => return Ok(Command::Help),
        "settings" => return Ok(Command::Settings),
        "save" => return Ok(Command::Save),
        _ => {}
    }

    let mut parts = line.split_whitespace();
    if !parts.next().is_some_and(|w| w.eq_ignore_ascii_case("set")) {
        return Ok(Command::Generate(line.to_string()));
    }

    let setting = parts.next().map(str::to_lowercase);
    let args: Vec<&str> = parts.collect();
    match (setting.as_deref(), args.as_slice()) {
        (Some("steps"), [n]) => Ok(Command::SetSteps(parse_number("steps", n)?)),
        (Some("size"), [w, h]) => Ok(Command::SetSize(
            parse_number("width", w)?,
            parse_number("height", h)?,
        )),
        (Some("seed"), [s]) if s.eq_ignore_ascii_case("random") => Ok(Command::SetSeed(None)),
        (Some("seed"), [s]) => Ok(Command::SetSeed(Some(parse_number("seed", s)?))),
        (Some("negative"), [none]) if none.eq_ignore_ascii_case("none") => {
            Ok(Command::SetNegative(None))
        }
        (Some("negative"), words) if !words.is_empty() => {
            Ok(Command::SetNegative(Some(words.join(" "))))
        }
        _ => Err(SET_USAGE.to_string()),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{} must be a non-negative integer, got '{}'", name, value))
}

/// User-facing rendering of a failed generation
fn describe_error(err: &Error) -> String {
    match err {
        Error::InvalidRequest(message) => format!("Invalid settings: {}", message),
        Error::ModelNotReady | Error::ModelLoad(_) => format!("Model unavailable: {}", err),
        Error::Inference(message) => format!("Generation failed: {}", message),
        Error::Storage { .. } => format!("{} (type `save` to retry)", err),
        _ => format!("Error: {}", err),
    }
}

/// A generated image whose write failed, kept for `save`
struct Unsaved {
    result: GenerationResult,
    request: GenerationRequest,
}

pub struct Session {
    runtime: Arc<DiffusionRuntime>,
    writer: Arc<ArtifactWriter>,
    settings: GenerationRequest,
    unsaved: Option<Unsaved>,
}

impl Session {
    pub fn new(runtime: Arc<DiffusionRuntime>, writer: ArtifactWriter, config: &Config) -> Self {
        Self {
            runtime,
            writer: Arc::new(writer),
            settings: GenerationRequest::new("", &config.generation),
            unsaved: None,
        }
    }

    /// Apply one command. Returns `false` when the loop should end.
    pub async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Empty => {}
            Command::Quit => {
                println!("Bye!");
                return false;
            }
            Command::Help => print_help(),
            Command::Settings => self.print_settings(),
            Command::SetSteps(steps) => {
                self.settings.steps = steps;
                println!("Steps set to {}", steps);
            }
            Command::SetSize(width, height) => {
                self.settings.width = width;
                self.settings.height = height;
                println!("Size set to {}x{}", width, height);
            }
            Command::SetSeed(seed) => {
                self.settings.seed = seed;
                match seed {
                    Some(seed) => println!("Seed fixed at {}", seed),
                    None => println!("Seed is random"),
                }
            }
            Command::SetNegative(negative) => {
                match &negative {
                    Some(text) => println!("Negative prompt set to \"{}\"", text),
                    None => println!("Negative prompt cleared"),
                }
                self.settings.negative_prompt = negative;
            }
            Command::Save => self.save().await,
            Command::Generate(prompt) => self.generate(prompt).await,
        }
        true
    }

    async fn generate(&mut self, prompt: String) {
        let request = GenerationRequest {
            prompt,
            ..self.settings.clone()
        };

        println!(
            "\nGenerating: {}...",
            request.prompt.chars().take(60).collect::<String>()
        );
        println!(
            "  Size: {}x{}  Steps: {}",
            request.width, request.height, request.steps
        );

        match self.runtime.generate(request.clone()).await {
            Ok(result) => {
                println!("  Seed: {}", result.seed_used);
                println!("Done in {:.1}s", result.elapsed_seconds);
                if let Some(unsaved) = self.unsaved.take() {
                    tracing::warn!(
                        "Discarding unsaved image (seed {})",
                        unsaved.result.seed_used
                    );
                }
                self.persist(Unsaved { result, request }).await;
            }
            Err(e) => println!("{}", describe_error(&e)),
        }
    }

    async fn save(&mut self) {
        match self.unsaved.take() {
            Some(unsaved) => self.persist(unsaved).await,
            None => println!("Nothing to save"),
        }
    }

    /// Write the image, keeping it for a later `save` if that fails
    async fn persist(&mut self, unsaved: Unsaved) {
        let writer = Arc::clone(&self.writer);
        let outcome = tokio::task::spawn_blocking(move || {
            let written = writer.write(
                &unsaved.result.image,
                unsaved.result.seed_used,
                &unsaved.request,
            );
            (written, unsaved)
        })
        .await;

        match outcome {
            Ok((Ok(record), _)) => println!("Saved: {}", record.path.display()),
            Ok((Err(e), unsaved)) => {
                println!("{}", describe_error(&e));
                self.unsaved = Some(unsaved);
            }
            Err(e) => tracing::error!("Write task failed: {}", e),
        }
    }

    fn print_settings(&self) {
        let s = &self.settings;
        println!("\nCurrent settings:");
        println!("  Steps: {}", s.steps);
        println!("  Size: {}x{}", s.width, s.height);
        match s.seed {
            Some(seed) => println!("  Seed: {}", seed),
            None => println!("  Seed: random"),
        }
        println!("  Negative prompt: {}", s.negative_prompt().unwrap_or("(none)"));
        println!("  Output: {}", self.writer.directory().display());
        if self.unsaved.is_some() {
            println!("  One image is waiting for `save`");
        }
    }
}

fn print_help() {
    println!("\nCommands:");
    println!("  <prompt>                  Generate an image");
    println!("  set steps <n>             Change the number of steps");
    println!("  set size <w> <h>          Change the image size (multiples of 16)");
    println!("  set seed <n|random>       Fix the seed or go back to random");
    println!("  set negative <text|none>  Set or clear the negative prompt");
    println!("  settings                  Show current settings");
    println!("  save                      Retry writing the last image");
    println!("  q / quit / exit           Leave");
}

pub async fn execute() -> Result<()> {
    let config = Config::load()?;
    let profile = select_device();

    println!("zimage interactive");
    println!("Model: {}", config.models.model_id);
    println!("Device: {}", profile);

    let runtime = Arc::new(DiffusionRuntime::new(
        config.models.model_id.clone(),
        profile,
        1,
    ));

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]")?,
    );
    spinner.set_message("Loading model...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let loaded = runtime
        .load(Arc::new(ZImageLoader::from_config(&config.models)))
        .await;
    match &loaded {
        Ok(()) => spinner.finish_with_message("Model loaded"),
        Err(_) => spinner.abandon_with_message("Model failed to load"),
    }
    loaded?;

    let mut session = Session::new(runtime, ArtifactWriter::from_config(&config.output), &config);
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("\n{}", RULE);
        print!("Prompt (or command): ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!("\nCtrl+C detected. Type 'q' to quit.");
                continue;
            }
        };

        // EOF
        let Some(line) = line else { break };

        match parse_command(&line) {
            Ok(command) => {
                if !session.handle(command).await {
                    break;
                }
            }
            Err(usage) => println!("{}", usage),
        }
    }

    Ok(())
}
