//! Sequence-labeling corpora: one `token label` pair per line, sentences
//! separated by blank lines. They are converted into a parallel pair of
//! token and label files and shuffled like any other corpus.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::corpus::{Corpus, CorpusOptions};
use crate::error::{Error, Result};

impl Corpus {
    pub fn from_labeling_file(path: &Path, opts: CorpusOptions) -> Result<Self> {
        let src = converted_file(&opts, ".src")?;
        let tgt = converted_file(&opts, ".tgt")?;
        let sentences = convert(path, src.as_file(), tgt.as_file())?;
        log::info!("Loaded {} labeled sentences from '{}'", sentences, path.display());
        let files = vec![(src.path().to_path_buf(), tgt.path().to_path_buf())];
        Ok(Corpus::from_files(files, opts).with_owned_inputs(vec![src, tgt]))
    }
}

fn converted_file(opts: &CorpusOptions, suffix: &str) -> Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("labeled").suffix(suffix);
    let file = match &opts.temp_dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    Ok(file)
}

/// Writes tokens and labels of every sentence as one line each and returns
/// the sentence count.
fn convert<W: Write>(path: &Path, src: W, tgt: W) -> Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut src = BufWriter::new(src);
    let mut tgt = BufWriter::new(tgt);
    let mut tokens: Vec<String> = Vec::new();
    let mut labels: Vec<String> = Vec::new();
    let mut sentences = 0;

    let mut emit = |tokens: &mut Vec<String>, labels: &mut Vec<String>| -> Result<()> {
        if !tokens.is_empty() {
            writeln!(src, "{}", tokens.join(" "))?;
            writeln!(tgt, "{}", labels.join(" "))?;
            sentences += 1;
        }
        tokens.clear();
        labels.clear();
        Ok(())
    };

    for (no, line) in reader.lines().enumerate() {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [] => emit(&mut tokens, &mut labels)?,
            [token, .., label] => {
                tokens.push(token.to_string());
                labels.push(label.to_string());
            }
            [_] => {
                return Err(Error::MalformedLine {
                    path: PathBuf::from(path),
                    line: no + 1,
                })
            }
        }
    }
    emit(&mut tokens, &mut labels)?;
    drop(emit);
    src.flush()?;
    tgt.flush()?;
    Ok(sentences)
}
