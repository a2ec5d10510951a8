//! EST operation tests

mod cacerts_test;
mod enroll_test;
mod reenroll_test;
