pub mod score;
pub mod token;
pub mod topk;

pub use score::ScoreStreamer;
pub use token::TokenStreamer;
