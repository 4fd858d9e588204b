pub(crate) mod openai_compat;
pub mod zhipu;
pub(crate) mod zhipu_translate;
