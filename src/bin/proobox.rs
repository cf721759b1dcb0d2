//! proobox - rootless container manager CLI
//!
//! ## Usage
//!
//! ```sh
//! proobox pull alpine:3.20
//! proobox run -d --name web alpine:3.20 sleep 3600
//! proobox ps -a
//! proobox build -t myapp:1 -f Prootfile .
//! proobox push myapp:1
//! ```
//!
//! Subcommands map one-to-one onto the library operations; this binary only
//! parses flags, renders output, and maps errors to exit codes.

use proobox::supervisor::{ExecOptions, LogOptions, PsOptions, RunOptions};
use proobox::{Builder, DataDir, RegistryClient, Supervisor};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Pull {
        image: String,
    },
    Push {
        image: String,
    },
    ImageLs,
    ImageRm {
        image: String,
    },
    ImageTag {
        src: String,
        dst: String,
    },
    Run {
        image: String,
        opts: RunOptions,
    },
    Ps {
        opts: PsOptions,
    },
    Rm {
        names: Vec<String>,
        force: bool,
        volumes: bool,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
        timeout: Duration,
        signal: i32,
    },
    Restart {
        name: String,
        timeout: Duration,
    },
    Build {
        tag: String,
        recipe: PathBuf,
        context: PathBuf,
    },
    Exec {
        name: String,
        command: Vec<String>,
        opts: ExecOptions,
    },
    Logs {
        name: String,
        opts: LogOptions,
    },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "pull" => {
            let image = args.get(2).cloned().ok_or("pull requires <image>")?;
            Ok(Command::Pull { image })
        }
        "push" => {
            let image = args.get(2).cloned().ok_or("push requires <image>")?;
            Ok(Command::Push { image })
        }
        "image" => parse_image(&args[2..]),
        "run" => parse_run(&args[2..]),
        "ps" => parse_ps(&args[2..]),
        "rm" => parse_rm(&args[2..]),
        "start" => {
            let name = args.get(2).cloned().ok_or("start requires <container>")?;
            Ok(Command::Start { name })
        }
        "stop" => parse_stop(&args[2..]),
        "restart" => parse_restart(&args[2..]),
        "build" => parse_build(&args[2..]),
        "exec" => parse_exec(&args[2..]),
        "logs" => parse_logs(&args[2..]),
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

fn parse_image(args: &[String]) -> Result<Command, String> {
    match args.first().map(|s| s.as_str()) {
        Some("ls") => Ok(Command::ImageLs),
        Some("rm") => {
            let image = args.get(1).cloned().ok_or("image rm requires <image>")?;
            Ok(Command::ImageRm { image })
        }
        Some("tag") => {
            let src = args.get(1).cloned().ok_or("image tag requires <src> <dst>")?;
            let dst = args.get(2).cloned().ok_or("image tag requires <src> <dst>")?;
            Ok(Command::ImageTag { src, dst })
        }
        _ => Err("image requires a subcommand: ls, rm, tag".to_string()),
    }
}

fn parse_run(args: &[String]) -> Result<Command, String> {
    let mut opts = RunOptions::default();
    let mut image = None;
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "-d" | "--detach" => {
                opts.detach = true;
                i += 1;
            }
            "-i" | "-t" | "-it" | "-ti" | "--interactive" => {
                opts.interactive = true;
                i += 1;
            }
            "--rm" => {
                opts.auto_remove = true;
                i += 1;
            }
            "-n" | "--name" => {
                opts.name = Some(take_value(args, &mut i, "--name")?);
            }
            "-e" | "--env" => {
                opts.env.push(take_value(args, &mut i, "--env")?);
            }
            "-v" | "--volume" => {
                opts.volumes.push(take_value(args, &mut i, "--volume")?);
            }
            "-w" | "--workdir" => {
                opts.workdir = Some(take_value(args, &mut i, "--workdir")?);
            }
            _ => {
                image = Some(args[i].clone());
                opts.command = args[i + 1..].to_vec();
                break;
            }
        }
    }

    let image = image.ok_or("run requires <image>")?;
    Ok(Command::Run { image, opts })
}

fn parse_ps(args: &[String]) -> Result<Command, String> {
    let mut opts = PsOptions::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-a" | "--all" => opts.all = true,
            "-q" | "--quiet" => opts.quiet = true,
            "-l" | "--latest" => opts.latest = true,
            "-s" | "--size" => opts.size = true,
            "-n" | "--last" => {
                let value = take_value(args, &mut i, "--last")?;
                opts.last = Some(value.parse().map_err(|_| "--last requires a number")?);
                continue;
            }
            other => return Err(format!("unknown ps flag: {}", other)),
        }
        i += 1;
    }
    Ok(Command::Ps { opts })
}

fn parse_rm(args: &[String]) -> Result<Command, String> {
    let mut force = false;
    let mut volumes = false;
    let mut names = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-f" | "--force" => force = true,
            "-v" | "--volumes" => volumes = true,
            name => names.push(name.to_string()),
        }
    }
    if names.is_empty() {
        return Err("rm requires at least one <container>".to_string());
    }
    Ok(Command::Rm {
        names,
        force,
        volumes,
    })
}

fn parse_stop(args: &[String]) -> Result<Command, String> {
    let mut timeout = proobox::constants::STOP_TIMEOUT;
    let mut signal = libc::SIGTERM;
    let mut name = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-t" | "--time" => {
                let value = take_value(args, &mut i, "--time")?;
                let secs: u64 = value.parse().map_err(|_| "--time requires seconds")?;
                timeout = Duration::from_secs(secs);
            }
            "-s" | "--signal" => {
                let value = take_value(args, &mut i, "--signal")?;
                signal = parse_signal(&value)?;
            }
            other => {
                name = Some(other.to_string());
                i += 1;
            }
        }
    }
    let name = name.ok_or("stop requires <container>")?;
    Ok(Command::Stop {
        name,
        timeout,
        signal,
    })
}

fn parse_restart(args: &[String]) -> Result<Command, String> {
    let mut timeout = proobox::constants::STOP_TIMEOUT;
    let mut name = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-t" | "--time" => {
                let value = take_value(args, &mut i, "--time")?;
                let secs: u64 = value.parse().map_err(|_| "--time requires seconds")?;
                timeout = Duration::from_secs(secs);
            }
            other => {
                name = Some(other.to_string());
                i += 1;
            }
        }
    }
    let name = name.ok_or("restart requires <container>")?;
    Ok(Command::Restart { name, timeout })
}

fn parse_build(args: &[String]) -> Result<Command, String> {
    let mut tag = None;
    let mut recipe = PathBuf::from("Prootfile");
    let mut context = PathBuf::from(".");
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-t" | "--tag" => tag = Some(take_value(args, &mut i, "--tag")?),
            "-f" | "--file" => recipe = PathBuf::from(take_value(args, &mut i, "--file")?),
            other => {
                context = PathBuf::from(other);
                i += 1;
            }
        }
    }
    let tag = tag.ok_or("build requires -t <repo:version>")?;
    Ok(Command::Build {
        tag,
        recipe,
        context,
    })
}

fn parse_exec(args: &[String]) -> Result<Command, String> {
    let mut opts = ExecOptions::default();
    let mut name = None;
    let mut command = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-d" | "--detach" => {
                opts.detach = true;
                i += 1;
            }
            "-i" | "-t" | "-it" | "-ti" | "--interactive" => {
                opts.interactive = true;
                i += 1;
            }
            "-u" | "--user" => {
                opts.user = Some(take_value(args, &mut i, "--user")?);
            }
            "-w" | "--workdir" => {
                opts.workdir = Some(take_value(args, &mut i, "--workdir")?);
            }
            "-e" | "--env" => {
                opts.env.push(take_value(args, &mut i, "--env")?);
            }
            other => {
                name = Some(other.to_string());
                command = args[i + 1..].to_vec();
                break;
            }
        }
    }
    let name = name.ok_or("exec requires <container> <command>")?;
    if command.is_empty() {
        return Err("exec requires a command".to_string());
    }
    Ok(Command::Exec {
        name,
        command,
        opts,
    })
}

fn parse_logs(args: &[String]) -> Result<Command, String> {
    let mut opts = LogOptions::default();
    let mut name = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-f" | "--follow" => {
                opts.follow = true;
                i += 1;
            }
            "--since" => {
                opts.since = Some(take_value(args, &mut i, "--since")?);
            }
            "--until" => {
                opts.until = Some(take_value(args, &mut i, "--until")?);
            }
            "--tail" => {
                let value = take_value(args, &mut i, "--tail")?;
                opts.tail = Some(value.parse().map_err(|_| "--tail requires a number")?);
            }
            "-t" | "--timestamps" => {
                opts.timestamps = true;
                i += 1;
            }
            "--details" => {
                opts.details = true;
                i += 1;
            }
            other => {
                name = Some(other.to_string());
                i += 1;
            }
        }
    }
    let name = name.ok_or("logs requires <container>")?;
    Ok(Command::Logs { name, opts })
}

/// Consumes the value following a flag at `args[*i]`, advancing past both.
fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    match args.get(*i + 1) {
        Some(value) => {
            *i += 2;
            Ok(value.clone())
        }
        None => Err(format!("{} requires a value", flag)),
    }
}

fn parse_signal(value: &str) -> Result<i32, String> {
    let upper = value.to_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    match name {
        "TERM" | "15" => Ok(libc::SIGTERM),
        "KILL" | "9" => Ok(libc::SIGKILL),
        "INT" | "2" => Ok(libc::SIGINT),
        "HUP" | "1" => Ok(libc::SIGHUP),
        "USR1" | "10" => Ok(libc::SIGUSR1),
        "USR2" | "12" => Ok(libc::SIGUSR2),
        _ => Err(format!("unknown signal: {}", value)),
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn cmd_pull(image: String) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let registry = RegistryClient::new(dir)?;
    let (tag, meta) = registry.pull(&image).await?;
    println!("{} ({})", tag, &meta.id[..12.min(meta.id.len())]);
    Ok(())
}

async fn cmd_push(image: String) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let registry = RegistryClient::new(dir)?;
    registry.push(&image).await
}

fn cmd_image_ls() -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let store = proobox::ImageStore::new(dir);
    println!(
        "{:<30} {:<14} {:<26} {:>12}",
        "REPOSITORY:TAG", "IMAGE ID", "CREATED", "SIZE"
    );
    for image in store.list()? {
        let label = image
            .repo_tags
            .first()
            .cloned()
            .unwrap_or_else(|| "<none>".to_string());
        println!(
            "{:<30} {:<14} {:<26} {:>12}",
            label,
            &image.id[..12.min(image.id.len())],
            image.created,
            human_size(image.size)
        );
    }
    Ok(())
}

fn cmd_image_rm(image: String) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let store = proobox::ImageStore::new(dir);
    let tag = store.remove(&image)?;
    println!("removed {}", tag);
    Ok(())
}

fn cmd_image_tag(src: String, dst: String) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let store = proobox::ImageStore::new(dir);
    let tag = store.tag(&src, &dst)?;
    println!("tagged {}", tag);
    Ok(())
}

async fn cmd_run(image: String, opts: RunOptions) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let supervisor = Supervisor::new(dir);
    let detach = opts.detach;
    let id = supervisor.run(&image, opts).await?;
    if detach {
        println!("{}", id);
    }
    Ok(())
}

fn cmd_ps(opts: PsOptions) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let supervisor = Supervisor::new(dir);
    let rows = supervisor.ps(&opts)?;

    if opts.quiet {
        for row in rows {
            println!("{}", row.id);
        }
        return Ok(());
    }

    if opts.size {
        println!(
            "{:<14} {:<22} {:<22} {:<26} {:<14} {:<18} {:>12}",
            "CONTAINER ID", "IMAGE", "COMMAND", "CREATED", "STATUS", "NAME", "SIZE"
        );
    } else {
        println!(
            "{:<14} {:<22} {:<22} {:<26} {:<14} {:<18}",
            "CONTAINER ID", "IMAGE", "COMMAND", "CREATED", "STATUS", "NAME"
        );
    }
    for row in rows {
        let command = truncate(&row.command, 20);
        if let Some(size) = row.size {
            println!(
                "{:<14} {:<22} {:<22} {:<26} {:<14} {:<18} {:>12}",
                row.id, row.image, command, row.started_at, row.status, row.name,
                human_size(size)
            );
        } else {
            println!(
                "{:<14} {:<22} {:<22} {:<26} {:<14} {:<18}",
                row.id, row.image, command, row.started_at, row.status, row.name
            );
        }
    }
    Ok(())
}

async fn cmd_rm(names: Vec<String>, force: bool, volumes: bool) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let supervisor = Supervisor::new(dir);
    for name in supervisor.rm(&names, force, volumes).await? {
        println!("{}", name);
    }
    Ok(())
}

async fn cmd_start(name: String) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let supervisor = Supervisor::new(dir);
    let name = supervisor.start(&name).await?;
    println!("{}", name);
    Ok(())
}

async fn cmd_stop(name: String, timeout: Duration, signal: i32) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let supervisor = Supervisor::new(dir);
    let name = supervisor.stop(&name, timeout, signal, false).await?;
    println!("{}", name);
    Ok(())
}

async fn cmd_restart(name: String, timeout: Duration) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let supervisor = Supervisor::new(dir);
    let name = supervisor.restart(&name, timeout).await?;
    println!("{}", name);
    Ok(())
}

async fn cmd_build(tag: String, recipe: PathBuf, context: PathBuf) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let builder = Builder::new(dir);
    let (tag, meta) = builder.build(&recipe, &context, &tag).await?;
    println!("built {} ({})", tag, &meta.id[..12.min(meta.id.len())]);
    Ok(())
}

async fn cmd_exec(name: String, command: Vec<String>, opts: ExecOptions) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let supervisor = Supervisor::new(dir);
    let code = supervisor.exec(&name, command, opts).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn cmd_logs(name: String, opts: LogOptions) -> proobox::Result<()> {
    let dir = DataDir::new()?;
    let supervisor = Supervisor::new(dir);

    for line in supervisor.collect_logs(&name, &opts)? {
        println!("{}", line);
    }

    if opts.follow && !opts.details {
        let path = supervisor.log_path(&name)?;
        let mut offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if len > offset {
                use std::io::{Read, Seek, SeekFrom};
                let mut file = std::fs::File::open(&path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = String::new();
                file.read_to_string(&mut buf)?;
                print!("{}", buf);
                offset = len;
            } else if len < offset {
                offset = len;
            }
        }
    }
    Ok(())
}

fn cmd_version() {
    println!("proobox version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"proobox - rootless container manager

USAGE:
    proobox <command> [options]

COMMANDS:
    pull <image>                        Pull an image (alpine resolves latest)
    push <image>                        Push an image to the configured backend
    image ls                            List local images
    image rm <image>                    Remove an image
    image tag <src> <dst>               Retag an image (same repository)
    run [opts] <image> [command...]     Create and start a container
    ps [-a] [-q] [-l] [-n N] [-s]       List containers
    rm [-f] [-v] <container>...         Remove containers
    start <container>                   Restart an exited container
    stop [-t secs] [-s SIG] <container> Stop a container
    restart [-t secs] <container>       Stop then start a container
    build -t <repo:ver> [-f file] [ctx] Build an image from a recipe
    exec [opts] <container> <command>   Run a command in a running container
    logs [opts] <container>             Show container output
    version                             Show version

RUN OPTIONS:
    -d, --detach          Run detached, output to container.log
    -i, -t, -it           Interactive with a TTY
    --rm                  Remove the container when it exits
    -n, --name <name>     Container name
    -e, --env <K=V>       Extra environment (repeatable)
    -v, --volume <h:c>    Extra bind (repeatable)
    -w, --workdir <dir>   Working directory

LOG OPTIONS:
    -f, --follow          Stream appended output
    --since/--until <ts>  ISO-8601 prefix filters (timestamped lines only)
    --tail <n>            Last n lines
    --details             Print the metadata record
"#
    );
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let command = match parse_args() {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            return ExitCode::FAILURE;
        }
    };

    let result = match command {
        Command::Pull { image } => cmd_pull(image).await,
        Command::Push { image } => cmd_push(image).await,
        Command::ImageLs => cmd_image_ls(),
        Command::ImageRm { image } => cmd_image_rm(image),
        Command::ImageTag { src, dst } => cmd_image_tag(src, dst),
        Command::Run { image, opts } => cmd_run(image, opts).await,
        Command::Ps { opts } => cmd_ps(opts),
        Command::Rm {
            names,
            force,
            volumes,
        } => cmd_rm(names, force, volumes).await,
        Command::Start { name } => cmd_start(name).await,
        Command::Stop {
            name,
            timeout,
            signal,
        } => cmd_stop(name, timeout, signal).await,
        Command::Restart { name, timeout } => cmd_restart(name, timeout).await,
        Command::Build {
            tag,
            recipe,
            context,
        } => cmd_build(tag, recipe, context).await,
        Command::Exec {
            name,
            command,
            opts,
        } => cmd_exec(name, command, opts).await,
        Command::Logs { name, opts } => cmd_logs(name, opts).await,
        Command::Version => {
            cmd_version();
            Ok(())
        }
        Command::Help => {
            cmd_help();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Rendering Helpers
// =============================================================================

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[unit])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}
