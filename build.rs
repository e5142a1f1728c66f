//! Build script for neural-gauge.
//!
//! The crate runs against the in-process stub backend by default. When
//! `LLAMA_CPP_LIB_DIR` points at a prebuilt llama.cpp (the directory holding
//! `libllama`), the library is added to the link line so a native
//! `Backend` implementation can bind to it.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=LLAMA_CPP_LIB_DIR");

    // Future: build llama.cpp from source when no prebuilt library is given.
    //
    // ```
    // cc::Build::new()
    //     .cpp(true)
    //     .file("vendor/llama.cpp/src/llama.cpp")
    //     .file("vendor/llama.cpp/ggml/src/ggml.c")
    //     .include("vendor/llama.cpp/include")
    //     .flag("-std=c++17")
    //     .compile("llama");
    // ```

    if let Ok(dir) = std::env::var("LLAMA_CPP_LIB_DIR") {
        println!("cargo:rustc-link-search=native={dir}");
        println!("cargo:rustc-link-lib=dylib=llama");
    }
}
