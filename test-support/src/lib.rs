//! 测试支持 crate
//!
//! 提供宿主机测试使用的 Mock 实现：中断控制、直接映射与 TLB、内存布局配置、
//! 可映射文件，以及一段充当"物理内存"的页对齐缓冲区。
//!
//! 这里不依赖任何内核 crate（避免循环依赖），各 crate 在 `cfg(test)` 下
//! 或在集成测试中为这些类型实现自己的 trait。

pub mod mock;
