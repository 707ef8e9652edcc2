pub mod participant_protocol;
