//! ftdiff-rs CLI: base vs. finetuned model chat and latent inspection

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand, ValueEnum};
use ftdiff_rs::config::get_model_configurations;
use ftdiff_rs::logit_lens::{logit_lens, LatentReadout};
use ftdiff_rs::model::load_model_from_config;
use ftdiff_rs::steering::read_steering_vector;
use ftdiff_rs::{
    patch_scope, select_device, DiffModel, DiffingConfig, DualModelChat, HfChatTokenizer,
    ModelCache, OrganismPair, SendTarget, SessionState, SessionStore, Target, DEFAULT_ID_PROMPT,
};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "ftdiff-rs")]
#[command(about = "Compare a base model with its finetuned organism")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long, global = true)]
    cpu: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Chat with both models side by side
    Chat {
        /// Diffing config (JSON: model + organism)
        #[arg(short, long)]
        config: PathBuf,

        /// Session file, created on first save
        #[arg(short, long, default_value = "ftdiff_session.json")]
        session: PathBuf,
    },
    /// Project a latent through the final norm and LM head
    LogitLens {
        #[command(flatten)]
        latent: LatentArgs,
    },
    /// Read a latent by patching it into an identity prompt
    PatchScope {
        #[command(flatten)]
        latent: LatentArgs,

        /// Layer whose output is overwritten
        #[arg(short, long)]
        layer: usize,

        /// Multiplier applied to the latent
        #[arg(long, default_value_t = 1.0)]
        scaler: f64,

        /// Identity prompt
        #[arg(long, default_value = DEFAULT_ID_PROMPT)]
        id_prompt: String,
    },
}

#[derive(clap::Args)]
struct LatentArgs {
    /// Diffing config (JSON: model + organism)
    #[arg(short, long)]
    config: PathBuf,

    /// Safetensors file holding one `(hidden_size,)` tensor
    #[arg(long)]
    latent: PathBuf,

    /// Model to read the latent through
    #[arg(short, long, value_enum, default_value = "base")]
    model: ModelChoice,

    /// Number of tokens to show per direction
    #[arg(short = 'k', long, default_value_t = 10)]
    top_k: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelChoice {
    Base,
    Finetuned,
}

impl From<ModelChoice> for Target {
    fn from(choice: ModelChoice) -> Self {
        match choice {
            ModelChoice::Base => Target::Base,
            ModelChoice::Finetuned => Target::Finetuned,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let device = select_device(cli.cpu);
    let mut cache = ModelCache::new();

    match cli.command {
        Command::Chat { config, session } => {
            let cfg = DiffingConfig::from_file(&config)?;
            let method = OrganismPair::from_config(&mut cache, &cfg, &device)?;
            let title = format!(
                "{} vs. {} ({})",
                cfg.model.model_id, cfg.organism.finetuned_model.model_id, cfg.organism.name
            );
            let chat = DualModelChat::new(&method, OrganismPair::METHOD_NAME, title);
            run_repl(&chat, &session)
        }
        Command::LogitLens { latent } => {
            let (model, tokenizer, vector) = load_latent_target(&mut cache, &latent, &device)?;
            let (probs, inv_probs) = logit_lens(&vector, model.lm())?;
            LatentReadout::from_probs("Logit lens", &probs, &inv_probs, &tokenizer, latent.top_k)?
                .print_detailed();
            Ok(())
        }
        Command::PatchScope {
            latent,
            layer,
            scaler,
            id_prompt,
        } => {
            let (model, tokenizer, vector) = load_latent_target(&mut cache, &latent, &device)?;
            let (probs, inv_probs) =
                patch_scope(&vector, model.lm(), &tokenizer, layer, scaler, &id_prompt)?;
            LatentReadout::from_probs("Patch scope", &probs, &inv_probs, &tokenizer, latent.top_k)?
                .print_detailed();
            Ok(())
        }
    }
}

fn load_latent_target(
    cache: &mut ModelCache,
    args: &LatentArgs,
    device: &Device,
) -> Result<(Arc<DiffModel>, Arc<HfChatTokenizer>, Tensor)> {
    let cfg = DiffingConfig::from_file(&args.config)?;
    let (base_cfg, ft_cfg) = get_model_configurations(&cfg);
    let model_cfg = match Target::from(args.model) {
        Target::Base => base_cfg,
        Target::Finetuned => ft_cfg,
    };
    let (model, tokenizer) = load_model_from_config(cache, &model_cfg, device)?;
    let latent = read_steering_vector(&args.latent)?;
    info!(
        "Latent {:?} through {} ({} layers)",
        latent.dims(),
        model.model_id(),
        model.lm().n_layers()
    );
    Ok((model, tokenizer, latent))
}

/// One REPL line
enum ReplCommand {
    Send(String),
    SendTo(SendTarget),
    Temperature(f64),
    MaxLength(usize),
    Sample(bool),
    Thinking(bool),
    ChatFormatting(bool),
    Clear,
    Show,
    Quit,
}

fn parse_switch(value: &str) -> Result<bool> {
    match value {
        "on" | "true" => Ok(true),
        "off" | "false" => Ok(false),
        other => anyhow::bail!("Expected on/off, got {other:?}"),
    }
}

fn parse_line(line: &str) -> Result<ReplCommand> {
    let Some(command) = line.strip_prefix('/') else {
        return Ok(ReplCommand::Send(line.to_string()));
    };
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(n, a)| (n, a.trim()));
    Ok(match name {
        "send-to" => ReplCommand::SendTo(arg.parse()?),
        "temp" => ReplCommand::Temperature(arg.parse().context("Invalid temperature")?),
        "max-length" => ReplCommand::MaxLength(arg.parse().context("Invalid max length")?),
        "sample" => ReplCommand::Sample(parse_switch(arg)?),
        "thinking" => ReplCommand::Thinking(parse_switch(arg)?),
        "chat" => ReplCommand::ChatFormatting(parse_switch(arg)?),
        "clear" => ReplCommand::Clear,
        "show" => ReplCommand::Show,
        "quit" | "exit" => ReplCommand::Quit,
        other => anyhow::bail!("Unknown command /{other}"),
    })
}

/// Apply a command to the session; returns false on quit
fn handle(
    chat: &DualModelChat<'_, OrganismPair>,
    state: &mut SessionState,
    command: ReplCommand,
) -> Result<bool> {
    let mut settings = state.settings.clone();
    match command {
        ReplCommand::Quit => return Ok(false),
        ReplCommand::Send(text) => {
            state.input = text;
            for reply in chat.send(state)? {
                println!("\n[{}]\n{}", reply.target.title(), reply.text);
            }
            return Ok(true);
        }
        ReplCommand::Clear => {
            chat.clear(state);
            println!("Conversation cleared");
            return Ok(true);
        }
        ReplCommand::Show => {
            print!("{}", chat.render(state));
            return Ok(true);
        }
        ReplCommand::SendTo(target) => settings.send_target = target,
        ReplCommand::Temperature(t) => settings.temperature = t,
        ReplCommand::MaxLength(n) => settings.max_length = n,
        ReplCommand::Sample(on) => settings.do_sample = on,
        ReplCommand::Thinking(on) => settings.enable_thinking = on,
        ReplCommand::ChatFormatting(on) => settings.use_chat_formatting = on,
    }
    settings.validate()?;
    state.settings = settings;
    println!("{:?}", state.settings);
    Ok(true)
}

fn run_repl(chat: &DualModelChat<'_, OrganismPair>, session_path: &Path) -> Result<()> {
    let mut store = SessionStore::load(session_path)?;
    print!("{}", chat.render(chat.session(&mut store)?));
    println!("\nType a message, or /send-to, /temp, /max-length, /sample, /thinking, /chat, /clear, /show, /quit");

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;

        let state = chat.session(&mut store)?;
        let keep_going = match parse_line(line.trim()).and_then(|cmd| handle(chat, state, cmd)) {
            Ok(keep_going) => keep_going,
            Err(e) => {
                eprintln!("Error: {e:#}");
                true
            }
        };
        store.save(session_path)?;
        if !keep_going {
            break;
        }
    }
    info!("Session saved to {}", session_path.display());
    Ok(())
}
