mod cli;

use std::io::Write;

use cli::{CliError, CliOptions, InputLine, classify_input};
use shared::config::AppConfig;
use shared::models::StructuredAnswer;
use shared::orchestrator::{QueryError, QueryOrchestrator, StreamEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "rag_cli=info,shared=warn";

#[tokio::main]
async fn main() {
    let options = match CliOptions::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(CliError::HelpRequested) => {
            print_usage();
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!();
            print_usage();
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to read config: {err}");
            std::process::exit(1);
        }
    };

    println!("Initializing knowledge base from {}", config.docs_path.display());
    let runtime = match shared::runtime::start(&config, options.rebuild).await {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to initialize rag engine: {err}");
            std::process::exit(1);
        }
    };

    println!("Ready. Type 'exit' to quit.\n");
    if let Err(err) = run_prompt_loop(&runtime.orchestrator, &options).await {
        eprintln!("failed to read input: {err}");
        std::process::exit(1);
    }
}

async fn run_prompt_loop(
    orchestrator: &QueryOrchestrator,
    options: &CliOptions,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("User Query: ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let question = match classify_input(&line) {
            InputLine::Quit => return Ok(()),
            InputLine::Skip => continue,
            InputLine::Question(question) => question,
        };

        if options.stream {
            stream_answer(orchestrator, question, options.session_id.clone()).await?;
        } else {
            match orchestrator
                .query(question, options.session_id.as_deref())
                .await
            {
                Ok(answer) => print_answer(&answer),
                Err(err) => print_query_error(&err),
            }
        }
    }
}

async fn stream_answer(
    orchestrator: &QueryOrchestrator,
    question: &str,
    session_id: Option<String>,
) -> std::io::Result<()> {
    let mut stream = match orchestrator.query_stream(question, session_id) {
        Ok(stream) => stream,
        Err(err) => {
            print_query_error(&err);
            return Ok(());
        }
    };

    println!();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Fragment(text) => {
                print!("{text}");
                std::io::stdout().flush()?;
            }
            StreamEvent::Retract => println!("\n[streamed text withdrawn]"),
            StreamEvent::Answer(answer) => {
                println!();
                print_answer(&answer);
            }
            StreamEvent::Error(message) => eprintln!("\nquery failed: {message}\n"),
        }
    }
    Ok(())
}

fn print_answer(answer: &StructuredAnswer) {
    println!("\n--- Guarded Response ---");
    match serde_json::to_string_pretty(answer) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => eprintln!("failed to render answer: {err}"),
    }
    println!("------------------------\n");
}

fn print_query_error(err: &QueryError) {
    eprintln!("query failed: {err}\n");
}

fn print_usage() {
    eprintln!(
        "Usage: cargo run -p rag-cli -- [--rebuild] [--session <id>] [--stream]\n\
         \n\
         Options:\n\
         - --rebuild         Rebuild the vector index from the documents directory\n\
         - --session <id>    Keep conversation history under this session id\n\
         - --stream          Print answer text as it is generated\n\
         - --help            Show this help text"
    );
}
