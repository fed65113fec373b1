fn main() {
    connbridge_lib::run()
}
