// Transaction construction: sizing, coin selection and building

pub mod builder;
pub mod coin_selection;
pub mod weight;

pub use builder::{
    BuildRequest, BuilderConfig, BuiltOutput, BuiltTransaction, HdSigner, InputSigner,
    TransactionBuilder, TransactionError, DEFAULT_RBF_SEQUENCE, FINAL_SEQUENCE,
};
pub use coin_selection::{
    CoinSelectionStrategy, CoinSelector, Selection, SelectionError, SelectionTarget,
};
