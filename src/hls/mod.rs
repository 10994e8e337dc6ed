//! HLS manifest handling.

pub mod rewriter;

pub use rewriter::{FetchedPlaylist, PlaylistRewriter, RewriteOptions, RewrittenPlaylist, rewrite};
