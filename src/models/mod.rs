pub mod decoder;
pub mod encoder;
pub mod seq2seq;

pub use decoder::{AttentionDecoder, DecoderState};
pub use encoder::{BiLstmEncoder, Encoder, EncoderType, TransformerEncoder};
pub use seq2seq::{BatchCost, Seq2SeqModel, TagScore, OUTSIDE_LABEL};
