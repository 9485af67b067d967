use std::env;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process::ExitCode;

use attnseq::config::{CorpusFormat, Options};
use attnseq::data::Corpus;
use attnseq::logging::{format_progress, run_dir, LogObserver, MetricsLogger, ProgressEvent, TrainingObserver};
use attnseq::vocab::is_reserved;
use attnseq::weights::read_meta;
use attnseq::{Error, Result, Seq2Seq};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

const USAGE: &str = "Usage: attnseq <train|valid|test|dump-vocab> <config.toml|config.json>";

/// Spinner updated on every progress event.
struct ProgressObserver {
    pb: ProgressBar,
}

impl ProgressObserver {
    fn new() -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}") {
            pb.set_style(style);
        }
        Self { pb }
    }
}

impl TrainingObserver for ProgressObserver {
    fn on_epoch_begin(&mut self, epoch: usize) {
        self.pb.set_message(format!("epoch {epoch}"));
    }

    fn on_progress(&mut self, event: &ProgressEvent) {
        self.pb.set_message(format_progress(event));
        self.pb.tick();
    }

    fn on_epoch_end(&mut self, epoch: usize, avg_cost: f64) {
        self.pb.println(format!("epoch {epoch} done, avg cost/word {avg_cost:.4}"));
    }
}

fn open_corpus(opts: &Options, path: &Path) -> Result<Corpus> {
    match opts.corpus_format {
        CorpusFormat::Parallel => Corpus::from_dir(path, &opts.src_lang, &opts.tgt_lang, opts.corpus_options()),
        CorpusFormat::Labeling => Corpus::from_labeling_file(path, opts.corpus_options()),
    }
}

fn attach_observers(engine: &mut Seq2Seq, opts: &Options) {
    engine.add_observer(Box::new(LogObserver));
    engine.add_observer(Box::new(ProgressObserver::new()));
    let dir = run_dir(opts.log_dir.as_deref(), opts.experiment.as_deref());
    match MetricsLogger::open(dir) {
        Ok(logger) => engine.add_observer(Box::new(logger)),
        Err(e) => warn!("metrics logging disabled: {e}"),
    }
}

fn train(opts: Options) -> Result<()> {
    let train_path = opts
        .train_corpus_path
        .clone()
        .ok_or_else(|| Error::Config("train_corpus_path is required for training".into()))?;
    let mut corpus = open_corpus(&opts, &train_path)?;
    let mut valid = match &opts.valid_corpus_path {
        Some(p) => Some(open_corpus(&opts, p)?),
        None => None,
    };

    let mut engine = if opts.model_path.exists() {
        info!("Continue training from {}", opts.model_path.display());
        Seq2Seq::load(opts.clone())?
    } else {
        let mut vocab = corpus.build_vocab(
            opts.src_vocab_size,
            opts.tgt_vocab_size,
            opts.min_token_freq,
            opts.shared_embeddings,
        )?;
        if opts.corpus_format == CorpusFormat::Labeling {
            let labels: Vec<String> = vocab
                .tgt
                .iter()
                .filter(|(t, _)| !is_reserved(t))
                .map(|(t, _)| t.to_string())
                .collect();
            vocab = vocab.with_classes(labels);
        }
        Seq2Seq::new(opts.clone(), vocab)?
    };
    attach_observers(&mut engine, &opts);
    engine.train(&mut corpus, valid.as_mut())
}

fn valid(opts: Options) -> Result<()> {
    let path = opts
        .valid_corpus_path
        .clone()
        .ok_or_else(|| Error::Config("valid_corpus_path is required for validation".into()))?;
    let mut corpus = open_corpus(&opts, &path)?;
    let mut engine = Seq2Seq::load(opts.clone())?;
    attach_observers(&mut engine, &opts);
    let avg = engine.validate(0, &mut corpus)?;
    info!("Validation avg cost/word {avg:.4}");
    Ok(())
}

fn test(opts: Options) -> Result<()> {
    let (input, output) = match (&opts.input_test_file, &opts.output_test_file) {
        (Some(i), Some(o)) => (i.clone(), o.clone()),
        _ => {
            return Err(Error::Config(
                "input_test_file and output_test_file are required for test".into(),
            ))
        }
    };
    let engine = Seq2Seq::load(opts)?;
    engine.decode_file(&input, &output)?;
    Ok(())
}

fn dump_vocab(opts: Options) -> Result<()> {
    let meta = read_meta(&opts.model_path)?;
    match &opts.vocab_dump_path {
        Some(path) => {
            let mut w = BufWriter::new(File::create(path)?);
            meta.vocab.dump(&mut w)?;
            w.flush()?;
            info!("Vocabulary written to {}", path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut w = stdout.lock();
            meta.vocab.dump(&mut w)?;
        }
    }
    Ok(())
}

fn run(mode: &str, config: &str) -> Result<()> {
    let opts = Options::from_path(config)?;
    match mode {
        "train" => train(opts),
        "valid" => valid(opts),
        "test" => test(opts),
        "dump-vocab" => dump_vocab(opts),
        other => Err(Error::Config(format!("unknown mode '{other}'\n{USAGE}"))),
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = env::args().skip(1).collect();
    let (Some(mode), Some(config)) = (args.first(), args.get(1)) else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };
    match run(mode, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
