use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use tape::args::{DistributedTrainArgs, EmbedArgs, EvalArgs, GridsearchArgs, TrainArgs};
use tape::RunRequest;

#[derive(Parser)]
#[command(author, version, about = "Train, evaluate and embed protein sequence models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on a task
    Train(TrainArgs),
    /// Evaluate a pretrained model on a task split
    Eval(EvalArgs),
    /// Embed the sequences of a FASTA file with a pretrained model
    Embed(EmbedArgs),
    /// Train with one worker process per accelerator
    DistributedTrain(DistributedTrainArgs),
    /// Run distributed training over every combination of a config's list values
    Gridsearch(GridsearchArgs),
    /// Run one training worker of a distributed launch
    #[command(hide = true)]
    Worker {
        /// Run request as JSON
        #[arg(long)]
        request: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => {
            let summary = tape::run_train(Some(RunRequest::from_args(&args)?))?;
            println!(
                "Finished {} after {} epochs ({} steps), saved to {}",
                summary.exp_name,
                summary.epochs_run,
                summary.global_step,
                summary.save_path.display()
            );
        }
        Commands::Eval(args) => {
            let metrics = tape::run_eval(Some(RunRequest::from_args(&args)?))?;
            for (name, value) in &metrics {
                println!("{}: {:.4}", name, value);
            }
        }
        Commands::Embed(args) => {
            let outfile = tape::run_embed(Some(RunRequest::from_args(&args)?))?;
            println!("Embeddings written to {}", outfile.display());
        }
        Commands::DistributedTrain(args) => {
            tape::run_train_distributed(Some(RunRequest::from_args(&args)?))?;
        }
        Commands::Gridsearch(args) => {
            let report = tape::run_gridsearch(&args.config_file)?;
            if report.failed() > 0 {
                bail!(
                    "{} of {} gridsearch runs failed",
                    report.failed(),
                    report.outcomes.len()
                );
            }
        }
        Commands::Worker { request } => {
            tape::run_train(Some(RunRequest::from_json(&request)?))?;
        }
    }

    Ok(())
}
