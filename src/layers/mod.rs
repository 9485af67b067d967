pub mod attention;
pub mod feed_forward;
pub mod layer;
pub mod lstm;
pub mod multi_head_attention;

pub use attention::{AttentionOutput, AttentionPreProcessResult, AttentionUnit, COVERAGE_DIM};
pub use feed_forward::{FeedForwardLayer, PositionwiseFeedForward};
pub use layer::Layer;
pub use lstm::{CellState, LstmCell};
pub use multi_head_attention::MultiHeadAttention;
