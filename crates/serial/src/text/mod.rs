//! Text serialization: a two-pass tree rendering of the value model.
//!
//! A mapping pass counts strong and weak references so shared objects get
//! stable integer ids, then a format writer (XML or JSON) renders the same
//! walk into its document form. Only XML has a reader.

pub mod dom;
pub mod json;
pub mod mapper;
pub mod writer;
pub mod xml;

pub use dom::XmlNode;
pub use json::JsonTextWriter;
pub use mapper::{TextObjectMap, TextObjectMapper};
pub use writer::{write_object_body, write_value_text, TextValueWriter};
pub use xml::{XmlTextReader, XmlTextWriter};
