//! Clusterform Core - Addresses, values, declarations, schemas, and error handling

pub mod address;
pub mod declaration;
pub mod error;
pub mod expr;
pub mod record;
pub mod schema;
pub mod value;

pub use address::ResourceAddress;
pub use declaration::{
    parse_variable_override, Document, Lifecycle, OutputDecl, ResourceDecl, VariableDecl,
};
pub use error::{Error, Result};
pub use expr::{EachBinding, EvalContext, Expr, PathStep, ResourceRef, Selector, Template};
pub use record::{Action, Drift, DriftKind, StateRecord, StateSnapshot};
pub use schema::{AttributeMode, AttributeSchema, ReplacePolicy, ResourceSchema, SchemaSet};
pub use value::{Attributes, PlannedAttributes, Resolved};
