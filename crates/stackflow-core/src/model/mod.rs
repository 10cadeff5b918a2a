//! モデル定義
//!
//! StackFlowで使用されるデータモデルを定義します。
//! 宣言（spec）側とステータス側は別モジュールに分かれています。

mod affinity;
mod machine;
mod network;
mod status;
mod topology;

// Re-exports
pub use affinity::*;
pub use machine::*;
pub use network::*;
pub use status::*;
pub use topology::*;
