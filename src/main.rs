use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;
use tracing::info;

use slot_engine::logging::{self, LogFormat};
use slot_engine::{
    load_scorer_config, BatchEngine, EngineConfig, Error, PrefillInputs, ReferenceScorer, Result,
    SamplingConfig, ScorerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "slot-engine")]
#[command(about = "Drive the reference scorer through prefill, insert and generate")]
struct Args {
    /// Engine configuration (JSON); defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scorer configuration (JSON); defaults are used when omitted
    #[arg(long)]
    scorer_config: Option<PathBuf>,

    /// SafeTensors weights for the reference scorer; seeded weights when omitted
    #[arg(long)]
    weights: Vec<PathBuf>,

    /// Prompt as comma-separated token ids; repeat to fill more slots
    #[arg(short, long, default_value = "1,2,3")]
    prompt: Vec<String>,

    /// Number of generate steps
    #[arg(long, default_value = "8")]
    steps: usize,

    /// Temperature for the first token (0 = greedy)
    #[arg(long, default_value = "0.0")]
    temperature: f32,

    /// Sampling seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Log format: pretty or json
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_prompt(text: &str) -> Result<Vec<u32>> {
    text.split(',')
        .map(|id| {
            id.trim()
                .parse::<u32>()
                .map_err(|e| Error::InvalidInput(format!("bad token id {id:?}: {e}")))
        })
        .collect()
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_with_level_and_format(
        Some(args.log_level.as_str()),
        LogFormat::parse(&args.log_format),
    );

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let scorer_config = match &args.scorer_config {
        Some(path) => load_scorer_config(path)?,
        None => ScorerConfig::default(),
    };
    if args.prompt.len() > config.max_batch_size {
        return Err(Error::Config(format!(
            "{} prompts do not fit in {} slots",
            args.prompt.len(),
            config.max_batch_size
        )));
    }

    let device = Device::Cpu;
    let scorer = ReferenceScorer::new(scorer_config).with_weights(args.weights.clone());
    let engine = BatchEngine::new(config, scorer, device.clone())?;
    let params = engine.load_params()?;
    let hyperparams = SamplingConfig {
        temperature: args.temperature,
        seed: args.seed,
        ..SamplingConfig::default()
    };

    let mut state = engine.init_decode_state()?;
    for (slot, text) in args.prompt.iter().enumerate() {
        let inputs = PrefillInputs::from_tokens(&parse_prompt(text)?, &device)?;
        let (prefix, result) = engine.prefill(&params, &inputs, None, &hyperparams)?;
        info!(slot, first_token = result.token()?, "Prefilled");
        state = engine.insert(prefix, &state, slot, &hyperparams)?;
    }

    for step in 0..args.steps {
        let (next, result) = engine.generate(&params, state)?;
        state = next;
        for slot in 0..args.prompt.len() {
            let data = result.slot_data(slot)?;
            info!(step, slot, token = data.tokens[0], length = data.length, "Generated");
        }
    }

    let lens = state.gen_lens()?;
    for slot in 0..args.prompt.len() {
        let row = state.results_row(slot)?;
        let generated = (lens[slot] as usize).min(row.len());
        println!("slot {slot}: {:?}", &row[..generated]);
    }
    Ok(())
}
