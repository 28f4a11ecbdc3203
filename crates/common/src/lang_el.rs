//! Reserved language-element (type) ids.
//!
//! Grammar-defined types are numbered from [`FIRST_USER_ID`] upward by the
//! compiler. The ids below are fixed so the runtime can recognise its own
//! generic value kinds.

/// Type identifier carried by every tree.
pub type LangElId = u16;

/// Wildcard used by iterator searches unless the program overrides it.
pub const ID_ANY: LangElId = 0;
pub const ID_PTR: LangElId = 1;
pub const ID_BOOL: LangElId = 2;
pub const ID_INT: LangElId = 3;
pub const ID_STR: LangElId = 4;
pub const ID_STREAM: LangElId = 5;
pub const ID_IGNORE: LangElId = 6;
pub const ID_ACCUM: LangElId = 7;
/// First id available to grammar-defined types.
pub const FIRST_USER_ID: LangElId = 8;

/// Name of a reserved id, if it is one.
pub fn builtin_name(id: LangElId) -> Option<&'static str> {
    match id {
        ID_ANY => Some("any"),
        ID_PTR => Some("ptr"),
        ID_BOOL => Some("bool"),
        ID_INT => Some("int"),
        ID_STR => Some("str"),
        ID_STREAM => Some("stream"),
        ID_IGNORE => Some("ignore"),
        ID_ACCUM => Some("accum"),
        _ => None,
    }
}
