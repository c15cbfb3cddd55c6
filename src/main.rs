fn main() {
    checkup_sync_lib::run()
}
