mod admission_tests;
mod util;
