#![allow(dead_code)]

pub mod http;
pub mod invoice;
pub mod mock;
pub mod wait;
