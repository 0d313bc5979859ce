mod helpers;
mod tests_rewrite;
