//! StackFlow Core
//!
//! クラスタトポロジー（宣言されたゾーン・ネットワーク・アフィニティグループ・
//! マシン）と、リコンシリエーションが書き戻すステータスのモデルを定義します。
//! `stack.kdl` のパースとアドミッション検証もこのクレートの責務です。

pub mod error;
pub mod model;
pub mod parser;
pub mod validation;

pub use error::{FlowError, Result};
pub use model::*;
pub use parser::{parse_kdl_file, parse_kdl_string};
pub use validation::{FieldError, validate_create, validate_update};
