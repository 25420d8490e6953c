use clap::{ArgAction, Parser, ValueEnum};
use colored::Colorize;
use indoc::indoc;
use strum::IntoEnumIterator;

use flowmid::{
    backend::targets::{Target, TargetFeature},
    config::PassOptions,
    diagnostics::ConsoleSink,
    middle::{
        CompilationContext, compile_components, flow::pretty_print::pretty_print_component,
        policy::Policy,
    },
    samples::Sample,
};

#[derive(Debug, Parser)]
#[command(
    version,
    about = "Runs the middle passes over sample flow graphs",
    long_about = indoc! {"
        Runs type-check synthesis, call-graph optimization and value-convention
        annotation over built-in sample components and prints the diagnostics.

        EXAMPLES:
            flowmid --list
            flowmid let-merge --show-graph
            flowmid arithmetic --speed 3 --safety 0 -v
    "}
)]
struct Args {
    /// Samples to compile. All of them when none are given.
    #[arg(value_enum)]
    samples: Vec<Sample>,

    /// List the samples and exit
    #[arg(long)]
    list: bool,

    /// Print each component before and after the passes
    #[arg(long)]
    show_graph: bool,

    /// Print graphs without color
    #[arg(long)]
    no_color: bool,

    /// Enable verbose logging (use multiple times for increased verbosity)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Set log level (overrides --verbose)
    #[arg(long, value_enum)]
    log: Option<LogLevel>,

    #[arg(long, default_value_t = 1)]
    speed: u8,

    #[arg(long, default_value_t = 1)]
    space: u8,

    #[arg(long, default_value_t = 1)]
    safety: u8,

    #[arg(long, default_value_t = 1)]
    debug: u8,

    #[arg(long, default_value_t = 1)]
    compilation_speed: u8,

    #[arg(long, default_value_t = 1)]
    inhibit_warnings: u8,

    /// Target features templates may use
    #[arg(long, value_enum, value_delimiter = ',')]
    features: Vec<TargetFeature>,

    #[arg(long)]
    suppress_warnings: bool,

    /// Rejected templates listed in one efficiency note
    #[arg(long, default_value_t = 3)]
    max_rejected_templates: usize,

    /// Cost difference that makes a template choice worth a note
    #[arg(long, default_value_t = 5)]
    note_cost_threshold: u32,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Args {
    fn policy(&self) -> Policy {
        Policy::default()
            .with_speed(self.speed)
            .with_space(self.space)
            .with_safety(self.safety)
            .with_debug(self.debug)
            .with_compilation_speed(self.compilation_speed)
            .with_inhibit_warnings(self.inhibit_warnings)
    }

    fn options(&self) -> PassOptions {
        PassOptions {
            max_rejected_templates: self.max_rejected_templates,
            note_cost_threshold: self.note_cost_threshold,
            suppress_warnings: self.suppress_warnings,
            default_policy: self.policy(),
            ..Default::default()
        }
        .with_features(self.features.iter().copied())
    }
}

fn setup_logging(verbose: u8, log_level: Option<LogLevel>) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = match log_level {
        Some(level) => EnvFilter::new(match level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }),
        None => match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        },
    };

    let formatter = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_level(true);

    tracing_subscriber::registry()
        .with(formatter)
        .with(filter)
        .init();
}

fn main() {
    let args = Args::parse();

    setup_logging(args.verbose, args.log);

    if args.list {
        for sample in Sample::iter() {
            println!("{:<16} {}", sample.to_string().blue(), sample.description());
        }
        return;
    }

    let samples = if args.samples.is_empty() {
        Sample::iter().collect()
    } else {
        args.samples.clone()
    };

    let registry = Target::X86_64.template_registry();
    let options = args.options();
    let color = !args.no_color;

    let mut components = Vec::new();
    for sample in samples {
        match sample.build(&registry, options.default_policy) {
            Ok(component) => components.push(component),
            Err(error) => {
                eprintln!("{}{} {sample}: {error}", "error".red().bold(), ":".white().bold());
                std::process::exit(1);
            }
        }
    }

    if args.show_graph {
        for component in &components {
            println!("{}", "before".white().bold());
            print!("{}", pretty_print_component(component, &registry, color));
        }
    }

    let mut sink = ConsoleSink;
    let mut ctx = CompilationContext::new(&options, &registry, &mut sink);
    let reports = compile_components(&mut components, &mut ctx);

    let mut failed = false;
    for (report, component) in reports.iter().zip(&components) {
        if args.show_graph {
            println!("{}", "after".white().bold());
            print!("{}", pretty_print_component(component, &registry, color));
        }

        let counts = &report.diagnostics;
        let status = match &report.outcome {
            Ok(()) => "ok".green(),
            Err(_) => {
                failed = true;
                "aborted".red()
            }
        };

        println!(
            "{} {status}: {} notes, {} warnings, {} errors",
            report.name.value().blue(),
            counts.notes,
            counts.warnings,
            counts.errors
        );
    }

    if failed {
        std::process::exit(1);
    }
}
