fn main() -> std::io::Result<()> {
    siteassist_server::main()
}
