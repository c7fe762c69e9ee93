mod docker;

pub use docker::DockerRuntime;
