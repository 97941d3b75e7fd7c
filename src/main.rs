use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use uuid::Uuid;

use foreman::agent::adapter_from_name;
use foreman::cli::{Cli, Command};
use foreman::config::ProjectConfig;
use foreman::executor::roles::RoleSequencedExecutor;
use foreman::executor::single::SingleProcessExecutor;
use foreman::executor::{
    CapturePolicy, ExecutionMode, ExecutionRequest, Executor, Session,
};
use foreman::log::ExecutionLog;
use foreman::permission::store::{Rule, RuleFile};
use foreman::permission::{AllowList, PromptWaiters, RemotePrompt, RoutedPrompt};
use foreman::tunnel::Tunnel;

fn main() -> Result<()> {
    let cli = Cli::parse();
    // Commands whose stdout/stderr is the product keep logging quiet.
    let quiet = matches!(&cli.command, Command::Config | Command::Attach { .. });

    let filter = match cli.verbose {
        0 if quiet => "foreman=warn",
        0 => "foreman=info",
        1 => "foreman=debug",
        _ => "foreman=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd =
        std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;

    if !quiet || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .foreman/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            context,
            plan_id,
            plan_title,
            plan_path,
            mode,
            agent,
            roles,
            capture,
        } => run(
            &cwd, config, context, plan_id, plan_title, plan_path, mode, agent, roles, &capture,
        ),
        Command::Attach { socket } => foreman::monitor::attach(&socket),
        Command::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    cwd: &Path,
    config: ProjectConfig,
    context: String,
    plan_id: Option<String>,
    plan_title: Option<String>,
    plan_path: Option<PathBuf>,
    mode: Option<String>,
    agent: Option<String>,
    roles: bool,
    capture: &str,
) -> Result<()> {
    let mode_name = mode.unwrap_or_else(|| config.defaults.mode.clone());
    let Some(mode) = ExecutionMode::parse(&mode_name) else {
        bail!("unknown mode: {mode_name} (expected normal, simple, tdd, review, or bare)");
    };
    let capture = match capture {
        "none" => CapturePolicy::None,
        "result" => CapturePolicy::Result,
        "all" => CapturePolicy::All,
        other => bail!("unknown capture policy: {other} (expected none, result, or all)"),
    };

    let agent_name = agent.unwrap_or_else(|| config.defaults.agent.clone());
    let Some(adapter) = adapter_from_name(&agent_name) else {
        bail!("unknown agent: {agent_name}");
    };

    // The context argument is a file path when one exists, inline text
    // otherwise.
    let context_file = cwd.join(&context);
    let (context_text, context_source) = if context_file.is_file() {
        let text = std::fs::read_to_string(&context_file)
            .with_context(|| format!("failed to read context file: {}", context_file.display()))?;
        (text, Some(context_file))
    } else {
        (context, None)
    };
    if context_text.trim().is_empty() {
        bail!("plan context is empty");
    }

    let plan_id = plan_id.unwrap_or_else(|| {
        context_source
            .as_deref()
            .and_then(Path::file_stem)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("adhoc-{}", short_id()))
    });
    let plan_title = plan_title.unwrap_or_else(|| first_line(&context_text));
    let plan_path = plan_path
        .or(context_source)
        .unwrap_or_else(|| cwd.to_path_buf());

    let static_rules = parse_static_rules(&config.permissions.allow);
    let allow = AllowList::new(
        static_rules,
        RuleFile::project_settings(cwd),
        RuleFile::shared_store(),
        config.permissions.auto_approve_deletions,
    );

    let log_path = cwd
        .join(".foreman")
        .join("logs")
        .join(format!("{plan_id}.jsonl"));
    let log = ExecutionLog::new(&log_path)?;
    info!(log = %log_path.display(), "execution log");

    let tunnel = Arc::new(Tunnel::init());
    let prompt_waiters = Arc::new(PromptWaiters::default());
    let prompt_timeout = std::time::Duration::from_secs(config.permissions.prompt_timeout_secs);
    // Terminal prompts when one is attached; otherwise requests go out as
    // tunnel envelopes for an attached monitor to answer.
    let prompt = RoutedPrompt::new(RemotePrompt::new(
        Arc::clone(&tunnel),
        Arc::clone(&prompt_waiters),
        prompt_timeout,
    ));

    let session = Session {
        adapter,
        workspace: cwd.to_path_buf(),
        config,
        tunnel,
        allow: Arc::new(Mutex::new(allow)),
        prompt: Arc::new(prompt),
        prompt_waiters,
        log: Arc::new(log),
        local_input: true,
    };

    let request = ExecutionRequest {
        context: context_text,
        plan_id,
        plan_title,
        plan_path,
        mode,
        capture,
    };

    ctrlc::set_handler(move || {
        // The child process group receives its own SIGINT from the
        // terminal; exiting here tears down sockets via Drop handlers.
        eprintln!();
        std::process::exit(130);
    })
    .context("failed to install interrupt handler")?;

    let output = if roles {
        RoleSequencedExecutor::new(session).execute(&request)?
    } else {
        SingleProcessExecutor::new(session).execute(&request)?
    };

    if !output.content.is_empty() {
        println!("{}", output.content);
    }
    if let Some(failure) = &output.failure {
        eprintln!();
        eprintln!("run failed ({}): {}", failure.source.as_str(), failure.summary);
        if let Some(problems) = &failure.problems {
            eprintln!("problems:\n{problems}");
        }
        if let Some(solutions) = &failure.possible_solutions {
            eprintln!("possible solutions:\n{solutions}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn parse_static_rules(specs: &[String]) -> Vec<Rule> {
    let mut rules = Vec::new();
    for spec in specs {
        match Rule::parse(spec) {
            Some(rule) => rules.push(rule),
            None => warn!(rule = %spec, "ignoring malformed permission rule in config"),
        }
    }
    rules
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    let line = line.trim_start_matches('#').trim();
    let mut title: String = line.chars().take(80).collect();
    if title.is_empty() {
        title = "untitled plan".to_string();
    }
    title
}

fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}
