fn main() {
    // 起動バナーに出すバージョン文字列を git describe から作る。
    // コミットやブランチ切替で再生成する。
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let described = std::process::Command::new("git")
        .args(["describe", "--always", "--dirty", "--tags"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());

    // git の無い環境（tarballビルドなど）でも失敗させない
    let version = described.unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_VERSION={}", version);
}
