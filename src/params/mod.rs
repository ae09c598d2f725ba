// Parameter Marshalling
// Type inference, canonical naming and sensitive-field hashing for caller parameters

pub mod hashing;
pub mod infer;
pub mod normalize;
pub mod value;

pub use hashing::{apply_hashing, BcryptScheme, HashScheme, SensitiveFieldSpec};
pub use infer::infer;
pub use normalize::{canonical_name, normalize, normalize_json, ParameterEntry, ParameterSet, RawParameter};
pub use value::ParameterValue;
