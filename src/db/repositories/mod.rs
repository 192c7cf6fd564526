mod marks;
mod sessions;
