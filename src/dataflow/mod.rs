pub(crate) mod context;
pub(crate) mod facts;
pub(crate) mod interpreter;
pub(crate) mod state;
pub(crate) mod value;
pub(crate) mod worklist;
