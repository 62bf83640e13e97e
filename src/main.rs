fn main() {
    fusion_pipeline::cli::run();
}
