pub mod control_flow;
pub mod loop_analysis;

pub use control_flow::{
    find_basic_blocks, find_call_edges, find_edges, find_script_name, Block, BlockId, BlockList,
    BlockRange, ProcEntry, ProcId, ProcType, SegReference, SegType, XRefInfo,
};
pub use loop_analysis::{
    compute_dominators, find_natural_loops, find_natural_loops_in_range, sort_natural_loops, Loop,
};
