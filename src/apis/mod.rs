pub mod beadstore_types;
pub mod convoy_types;
pub mod polecat_types;
pub mod refinery_types;
pub mod rig_types;
pub mod witness_types;
