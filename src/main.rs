fn main() -> anyhow::Result<()> {
    sleeplog::run()
}
