pub mod file_time;
pub mod sized_wide_string;

pub mod prelude {
    pub use super::file_time::FileTime;
    pub use super::sized_wide_string::SizedWideString;
}
