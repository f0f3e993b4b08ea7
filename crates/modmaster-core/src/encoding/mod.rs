mod reader;
mod writer;

pub(crate) use reader::be_register;
pub use reader::Reader;
pub use writer::Writer;
