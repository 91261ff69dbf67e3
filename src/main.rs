fn main() {
    ebook_downloads::run();
}
