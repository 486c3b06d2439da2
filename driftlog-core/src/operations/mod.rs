pub mod converge_fragment;

pub use converge_fragment::{
    ConvergeFragmentOperation, ConvergeFragmentOperationRequest, ConvergeOutcome,
};
